//! 检测步骤的工作组
//!
//! 工作组按步骤类型构造，负责以有界并发调用外部检测项，并把
//! `(错误, 日志, 是否可重试)` 结果回送给执行器。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error};

use recycler_core::models::StepName;
use recycler_core::{CheckReport, CheckTarget, RecyclerError, RecyclerResult, StepChecker, StepMetrics};

use crate::wait_list::StepMeta;

/// 接收检测结果的一方，通常是 `StepExecutor`
#[async_trait]
pub trait StepResultHandler: Send + Sync {
    async fn handle_result(
        &self,
        steps: Vec<StepMeta>,
        error: Option<String>,
        log: String,
        need_retry: bool,
    );
}

#[async_trait]
pub trait WorkGroup: Send + Sync {
    fn step_name(&self) -> StepName;

    /// 单批次允许的最大主机数
    fn max_batch_size(&self) -> usize;

    /// 提交一批步骤，所有worker都忙时会等待空闲
    async fn submit(&self, steps: Vec<StepMeta>, handler: Arc<dyn StepResultHandler>);
}

/// 基于 `StepChecker` 的工作组，每台主机单独调用一次检测
pub struct CheckerWorkGroup {
    step_name: StepName,
    checker: Arc<dyn StepChecker>,
    workers: Arc<Semaphore>,
    metrics: Arc<dyn StepMetrics>,
}

impl CheckerWorkGroup {
    pub fn new(
        step_name: StepName,
        checker: Arc<dyn StepChecker>,
        worker_num: usize,
        metrics: Arc<dyn StepMetrics>,
    ) -> RecyclerResult<Self> {
        if worker_num == 0 {
            return Err(RecyclerError::Configuration(format!(
                "检测步骤 {step_name} 的worker数量必须大于0"
            )));
        }
        Ok(Self {
            step_name,
            checker,
            workers: Arc::new(Semaphore::new(worker_num)),
            metrics,
        })
    }

    fn target(meta: &StepMeta) -> CheckTarget {
        CheckTarget {
            suborder_id: meta.step.suborder_id.clone(),
            task_id: meta.step.task_id.clone(),
            step_id: meta.step.id.clone(),
            step_name: meta.step.step_name,
            host_id: meta.step.host_id,
            ip: meta.ip.clone(),
            asset_id: meta.asset_id.clone(),
        }
    }
}

#[async_trait]
impl WorkGroup for CheckerWorkGroup {
    fn step_name(&self) -> StepName {
        self.step_name
    }

    fn max_batch_size(&self) -> usize {
        self.checker.max_batch_size()
    }

    async fn submit(&self, steps: Vec<StepMeta>, handler: Arc<dyn StepResultHandler>) {
        for meta in steps {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(step = %self.step_name, "工作组已关闭，丢弃检测步骤 {}", meta.step.id);
                    continue;
                }
            };

            let checker = self.checker.clone();
            let metrics = self.metrics.clone();
            let handler = handler.clone();
            let step_name = self.step_name;

            tokio::spawn(async move {
                let _permit = permit;
                let target = Self::target(&meta);
                let started = Instant::now();

                let report = match AssertUnwindSafe(checker.check(&target)).catch_unwind().await {
                    Ok(report) => report,
                    Err(_) => {
                        error!(step = %step_name, step_id = %target.step_id, "检测执行发生panic");
                        CheckReport::rejected("检测执行异常", String::new())
                    }
                };

                metrics.record_step_latency(step_name, started.elapsed().as_secs_f64());
                if !report.is_success() {
                    metrics.record_step_error(step_name);
                }
                debug!(
                    step = %step_name,
                    step_id = %target.step_id,
                    success = report.is_success(),
                    retryable = report.retryable,
                    "检测调用返回"
                );

                handler
                    .handle_result(vec![meta], report.error, report.log, report.retryable)
                    .await;
            });
        }
    }
}
