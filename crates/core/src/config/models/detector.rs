use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// 单次批量写回检测任务的结果数上限
    pub result_batch_size: usize,
    /// 批量读取结果时的最长等待窗口（毫秒）
    pub result_batch_window_ms: u64,
    /// 重试延迟的随机抖动比例（0.0-1.0）
    pub retry_jitter_factor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            result_batch_size: 100,
            result_batch_window_ms: 200,
            retry_jitter_factor: 0.1,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.result_batch_size == 0 {
            return Err(anyhow::anyhow!("结果批量大小必须大于0"));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(anyhow::anyhow!(
                "重试抖动比例必须在0.0-1.0之间: {}",
                self.retry_jitter_factor
            ));
        }
        Ok(())
    }
}
