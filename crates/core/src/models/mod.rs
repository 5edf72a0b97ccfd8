//! 回收系统领域模型
//!
//! 持久化实体（回收单、回收主机、检测任务、检测步骤、步骤配置、退回任务）
//! 以及它们的状态枚举。所有状态值都是封闭枚举，未知字符串在反序列化时即报错。

mod detect;
mod host;
mod order;
mod return_task;

pub use detect::*;
pub use host::*;
pub use order::*;
pub use return_task::*;
