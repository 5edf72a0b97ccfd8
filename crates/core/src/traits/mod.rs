//! 核心抽象接口
//!
//! - `repository`：文档存储的数据访问接口
//! - `clients`：外部系统（检测接口、CMDB、退回平台、选主）
//! - `metrics`：检测步骤与回收单指标记录

pub mod clients;
pub mod metrics;
pub mod repository;

pub use clients::*;
pub use metrics::*;
pub use repository::*;
