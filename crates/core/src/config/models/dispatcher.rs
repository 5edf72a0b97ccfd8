use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 同时处理的回收单上限，避免压垮下游服务
    pub max_concurrent_orders: usize,
    /// 退回单仍在执行时，回收单重新入队前的等待时间（秒）
    pub requeue_delay_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_orders: 5,
            requeue_delay_seconds: 60,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_orders == 0 {
            return Err(anyhow::anyhow!("最大并发回收单数必须大于0"));
        }
        Ok(())
    }
}

/// 恢复服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// 创建时间早于 now - max_stay 的回收单不再恢复
    pub max_stay_minutes: i64,
    /// 创建时间晚于 now - min_stay 的回收单不参与恢复
    pub min_stay_minutes: i64,
    /// 并行恢复的回收单数
    pub parallelism: usize,
    /// 等待成为主节点的轮询间隔（秒）
    pub master_poll_interval_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_stay_minutes: 7 * 24 * 60,
            min_stay_minutes: 0,
            parallelism: 10,
            master_poll_interval_seconds: 60,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_stay_minutes < 0 || self.max_stay_minutes <= self.min_stay_minutes {
            return Err(anyhow::anyhow!(
                "恢复时间窗口无效: [{}, {})",
                self.min_stay_minutes,
                self.max_stay_minutes
            ));
        }
        if self.parallelism == 0 {
            return Err(anyhow::anyhow!("恢复并发数必须大于0"));
        }
        if self.master_poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("选主轮询间隔必须大于0"));
        }
        Ok(())
    }
}
