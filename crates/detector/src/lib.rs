//! 检测阶段
//!
//! 自底向上：等待队列、限流器、延迟队列、工作组、步骤执行器、执行器注册表、
//! 单子单编排 `StepRunner`，以及检测阶段协调器 `Detector`。

pub mod checkers;
pub mod delay_queue;
pub mod detector;
pub mod executor_registry;
pub mod rate_limiter;
pub mod step_executor;
pub mod step_runner;
pub mod wait_list;
pub mod work_group;

pub use checkers::PreChecker;
pub use delay_queue::DelayQueue;
pub use detector::{DetectSummary, Detector};
pub use executor_registry::ExecutorRegistry;
pub use rate_limiter::RateLimiter;
pub use step_executor::{StepExecutor, StepExecutorConfig, StepResult, MIN_RETRY_DELAY};
pub use step_runner::{ResultStream, StepBatch, StepRunner};
pub use wait_list::{default_score, StepMeta, WaitList};
pub use work_group::{CheckerWorkGroup, StepResultHandler, WorkGroup};
