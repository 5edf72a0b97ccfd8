use serde::{Deserialize, Serialize};

/// 主机转移目标
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitConfig {
    /// 资源回收业务
    pub recycle_biz_id: i64,
    /// 云服务器待回收模块
    pub cvm_module_id: i64,
    /// 物理机待回收模块
    pub pm_module_id: i64,
    /// 裁撤/过保物理机模块
    pub dissolve_module_id: i64,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            recycle_biz_id: 213,
            cvm_module_id: 5069,
            pm_module_id: 5070,
            dissolve_module_id: 5071,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnerConfig {
    /// 查询退回单状态的间隔（秒）
    pub poll_interval_seconds: u64,
    /// 单次处理中最多查询的次数，超过后留待下次处理
    pub max_polls: u32,
}

impl Default for ReturnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            max_polls: 120,
        }
    }
}

impl ReturnerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_polls == 0 {
            return Err(anyhow::anyhow!("退回状态查询次数必须大于0"));
        }
        Ok(())
    }
}
