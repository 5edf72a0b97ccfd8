//! # Recycler Testing Utils
//!
//! 工作区共享的测试工具：
//!
//! - **Builders**: 回收单、主机、步骤配置的构造器
//! - **Mocks**: 可编排结果的检测项、CMDB、退回平台、选主、指标记录器
//! - **Helpers**: 内存存储初始化、条件等待、关闭信号
//!
//! ```toml
//! [dev-dependencies]
//! recycler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
