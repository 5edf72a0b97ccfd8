use async_trait::async_trait;

use recycler_core::{CheckReport, CheckTarget, StepChecker};

/// 内置预检查：校验主机的基本标识信息是否完整
#[derive(Debug, Clone)]
pub struct PreChecker {
    max_batch_size: usize,
}

impl PreChecker {
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }
}

impl Default for PreChecker {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl StepChecker for PreChecker {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn check(&self, target: &CheckTarget) -> CheckReport {
        if target.host_id <= 0 {
            return CheckReport::rejected(
                "主机ID无效",
                format!("host_id={}", target.host_id),
            );
        }
        if target.ip.trim().is_empty() {
            return CheckReport::rejected("主机IP为空", format!("host_id={}", target.host_id));
        }
        if target.asset_id.trim().is_empty() {
            return CheckReport::rejected("主机固资号为空", format!("ip={}", target.ip));
        }
        CheckReport::success(format!("预检查通过: ip={}, asset_id={}", target.ip, target.asset_id))
    }
}

#[cfg(test)]
mod tests {
    use recycler_core::models::StepName;

    use super::*;

    fn target(ip: &str, asset_id: &str) -> CheckTarget {
        CheckTarget {
            suborder_id: "1-1".to_string(),
            task_id: "DT1".to_string(),
            step_id: "DT1-1".to_string(),
            step_name: StepName::PreCheck,
            host_id: 1001,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_pre_check() {
        let checker = PreChecker::default();
        assert!(checker.check(&target("10.0.0.1", "TC001")).await.is_success());

        let report = checker.check(&target("", "TC001")).await;
        assert_eq!(report.error.as_deref(), Some("主机IP为空"));
        assert!(!report.retryable);
    }
}
