use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use recycler_core::models::{DetectStepCfg, StepName};
use recycler_core::{
    DetectStepRepository, DetectorConfig, RecyclerError, RecyclerResult, StepChecker, StepMetrics,
};

use crate::rate_limiter::RateLimiter;
use crate::step_executor::{StepExecutor, StepExecutorConfig};
use crate::wait_list::WaitList;
use crate::work_group::{CheckerWorkGroup, WorkGroup};

struct Registration {
    executor: Arc<StepExecutor>,
    work_group: Arc<dyn WorkGroup>,
}

/// 步骤类型到执行器的注册表
///
/// 启动时按步骤配置一次性构造并校验，缺少检测项实现或批量大小超过工作组上限
/// 都会直接返回错误。
pub struct ExecutorRegistry {
    registrations: HashMap<StepName, Registration>,
}

impl ExecutorRegistry {
    pub fn build(
        cfgs: &[DetectStepCfg],
        checkers: &HashMap<StepName, Arc<dyn StepChecker>>,
        step_repo: Arc<dyn DetectStepRepository>,
        metrics: Arc<dyn StepMetrics>,
        detector_config: &DetectorConfig,
    ) -> RecyclerResult<Self> {
        let mut registrations = HashMap::new();
        let mut sequences: HashMap<u32, StepName> = HashMap::new();

        for cfg in cfgs.iter().filter(|cfg| cfg.enable) {
            if registrations.contains_key(&cfg.name) {
                return Err(RecyclerError::Configuration(format!(
                    "检测步骤 {} 重复配置",
                    cfg.name
                )));
            }
            if let Some(other) = sequences.insert(cfg.sequence, cfg.name) {
                return Err(RecyclerError::Configuration(format!(
                    "检测步骤 {} 与 {} 的序号 {} 重复",
                    cfg.name, other, cfg.sequence
                )));
            }

            let checker = checkers
                .get(&cfg.name)
                .cloned()
                .ok_or_else(|| RecyclerError::UnsupportedStep(cfg.name.to_string()))?;

            let work_group: Arc<dyn WorkGroup> = Arc::new(CheckerWorkGroup::new(
                cfg.name,
                checker,
                cfg.worker_num,
                metrics.clone(),
            )?);
            Self::validate_batch_size(cfg, work_group.as_ref())?;

            let limiter = Arc::new(RateLimiter::new(cfg.rate_limit_qps, cfg.rate_limit_burst)?);
            let executor = Arc::new(StepExecutor::new(
                StepExecutorConfig::from_cfg(cfg, detector_config.retry_jitter_factor),
                limiter,
                Arc::new(WaitList::new()),
                step_repo.clone(),
                metrics.clone(),
            ));

            registrations.insert(cfg.name, Registration { executor, work_group });
        }

        Ok(Self { registrations })
    }

    fn validate_batch_size(cfg: &DetectStepCfg, work_group: &dyn WorkGroup) -> RecyclerResult<()> {
        if cfg.batch_size == 0 {
            return Err(RecyclerError::Configuration(format!(
                "检测步骤 {} 的批量大小必须大于0",
                cfg.name
            )));
        }
        if cfg.batch_size > work_group.max_batch_size() {
            return Err(RecyclerError::Configuration(format!(
                "检测步骤 {} 的批量大小 {} 超过工作组上限 {}",
                cfg.name,
                cfg.batch_size,
                work_group.max_batch_size()
            )));
        }
        Ok(())
    }

    pub fn get(&self, step_name: StepName) -> Option<Arc<StepExecutor>> {
        self.registrations
            .get(&step_name)
            .map(|registration| registration.executor.clone())
    }

    pub fn step_names(&self) -> Vec<StepName> {
        let mut names: Vec<StepName> = self.registrations.keys().copied().collect();
        names.sort();
        names
    }

    /// 启动所有执行器
    pub fn start(&self, shutdown: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let handles = self
            .registrations
            .values()
            .map(|registration| {
                registration
                    .executor
                    .clone()
                    .start(registration.work_group.clone(), shutdown.resubscribe())
            })
            .collect::<Vec<_>>();
        info!("已启动 {} 个检测步骤执行器", handles.len());
        handles
    }

    /// 通知所有执行器取消子单
    pub fn cancel_suborder(&self, suborder_id: &str) {
        for registration in self.registrations.values() {
            registration.executor.cancel_suborder(suborder_id);
        }
    }
}
