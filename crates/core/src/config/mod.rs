//! 配置管理
//!
//! 配置加载顺序：
//! 1. 各配置段的默认值
//! 2. 配置文件（TOML格式）
//! 3. 环境变量覆盖（前缀 `RECYCLER__`，层级分隔符 `__`）

pub mod models;

pub use models::*;
