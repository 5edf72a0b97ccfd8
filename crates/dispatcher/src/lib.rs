//! 回收单编排
//!
//! - `state_machine`：回收单状态、事件和流转表
//! - `dispatcher`：分发队列与按状态驱动各阶段的后台循环
//! - `transit` / `returner`：转移和退回阶段
//! - `recovery_service`：进程重启后按持久化状态恢复滞留的回收单

pub mod dispatcher;
pub mod recovery_service;
pub mod returner;
pub mod state_machine;
pub mod transit;
pub mod work_queue;

pub use dispatcher::Dispatcher;
pub use recovery_service::{RecoveryAction, RecoveryReport, RecoveryService, SystemRecoveryService};
pub use returner::{ProviderReturner, ReturnOutcome, ReturnPhase};
pub use state_machine::{Action, Guard, OrderEvent, OrderStateMachine, Transition};
pub use transit::{CmdbTransit, TransitPhase};
pub use work_queue::WorkQueue;
