//! 单个检测步骤类型的执行器
//!
//! 执行器循环：限流 → 从等待队列取出分值最低的一批 → 标记为运行中 → 交给工作组。
//! 工作组回送的结果按子单路由到提交时注册的结果通道，可重试的失败经延迟队列
//! 重新入队，不会立即转发。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use recycler_core::models::{DetectStepCfg, DetectStepStatus, StepFilter, StepName, StepUpdate};
use recycler_core::{
    DetectStepRepository, RecyclerError, RecyclerResult, StepMetrics,
};
use recycler_infrastructure::StructuredLogger;

use crate::delay_queue::DelayQueue;
use crate::rate_limiter::RateLimiter;
use crate::wait_list::{default_score, StepMeta, WaitList};
use crate::work_group::{StepResultHandler, WorkGroup};

/// 重试的最短延迟
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(3);

/// 等待队列为空时的轮询间隔
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 单个步骤的最终结果
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_name: StepName,
    pub step_id: String,
    pub task_id: String,
    pub host_id: i64,
    pub error: Option<String>,
}

impl StepResult {
    /// 跳过的步骤按成功计入
    pub fn skipped(meta: &StepMeta) -> Self {
        Self {
            step_name: meta.step.step_name,
            step_id: meta.step.id.clone(),
            task_id: meta.step.task_id.clone(),
            host_id: meta.step.host_id,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutorConfig {
    pub step_name: StepName,
    pub batch_size: usize,
    pub retry_interval: Duration,
    pub max_retry_times: u32,
    /// 重试延迟的随机抖动比例
    pub retry_jitter_factor: f64,
}

impl StepExecutorConfig {
    pub fn from_cfg(cfg: &DetectStepCfg, retry_jitter_factor: f64) -> Self {
        Self {
            step_name: cfg.name,
            batch_size: cfg.batch_size,
            retry_interval: Duration::from_secs(cfg.retry_interval_sec),
            max_retry_times: cfg.retry,
            retry_jitter_factor,
        }
    }

    fn retry_delay(&self) -> Duration {
        let base = self.retry_interval.max(MIN_RETRY_DELAY);
        if self.retry_jitter_factor <= 0.0 {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..=self.retry_jitter_factor);
        base + base.mul_f64(jitter)
    }
}

/// 子单在本执行器上的结果通道
struct SuborderChannel {
    rid: String,
    sender: mpsc::UnboundedSender<StepResult>,
    remaining: usize,
}

pub struct StepExecutor {
    config: StepExecutorConfig,
    rate_limiter: Arc<RateLimiter>,
    wait_list: Arc<WaitList>,
    retry_queue: DelayQueue<StepMeta>,
    step_repo: Arc<dyn DetectStepRepository>,
    metrics: Arc<dyn StepMetrics>,
    channels: Mutex<HashMap<String, SuborderChannel>>,
}

impl StepExecutor {
    pub fn new(
        config: StepExecutorConfig,
        rate_limiter: Arc<RateLimiter>,
        wait_list: Arc<WaitList>,
        step_repo: Arc<dyn DetectStepRepository>,
        metrics: Arc<dyn StepMetrics>,
    ) -> Self {
        Self {
            config,
            rate_limiter,
            wait_list,
            retry_queue: DelayQueue::new(),
            step_repo,
            metrics,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn step_name(&self) -> StepName {
        self.config.step_name
    }

    pub fn config(&self) -> &StepExecutorConfig {
        &self.config
    }

    /// 提交一个子单的全部步骤，返回该子单的结果通道
    ///
    /// 同一子单在上一次提交完成前不能重复提交。
    pub fn submit_steps(
        &self,
        suborder_id: &str,
        rid: &str,
        steps: Vec<StepMeta>,
    ) -> RecyclerResult<mpsc::UnboundedReceiver<StepResult>> {
        if let Some(meta) = steps
            .iter()
            .find(|meta| meta.step.step_name != self.config.step_name)
        {
            return Err(RecyclerError::StepMismatch {
                step: meta.step.step_name,
                executor: self.config.step_name,
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if steps.is_empty() {
            return Ok(receiver);
        }

        {
            let mut channels = self.channels.lock();
            if channels.contains_key(suborder_id) {
                return Err(RecyclerError::DuplicateSubmission {
                    suborder_id: suborder_id.to_string(),
                    step: self.config.step_name,
                });
            }
            channels.insert(
                suborder_id.to_string(),
                SuborderChannel {
                    rid: rid.to_string(),
                    sender,
                    remaining: steps.len(),
                },
            );
        }

        let now = Utc::now();
        let count = steps.len();
        self.wait_list.add(
            steps
                .into_iter()
                .map(|mut meta| {
                    meta.rid = rid.to_string();
                    meta.joined_at = now;
                    meta.retry_times = 0;
                    meta
                })
                .collect(),
        );
        debug!(
            step = %self.config.step_name,
            suborder_id = suborder_id,
            count = count,
            "检测步骤已入队"
        );

        Ok(receiver)
    }

    /// 取消子单：移除结果通道并清理尚未执行的条目，执行中的结果到达后被丢弃
    pub fn cancel_suborder(&self, suborder_id: &str) -> bool {
        let removed = self.channels.lock().remove(suborder_id).is_some();
        let waiting = self.wait_list.remove_where(|m| m.suborder_id() == suborder_id);
        let retrying = self
            .retry_queue
            .cancel_where(|m| m.suborder_id() == suborder_id);
        if removed {
            info!(
                step = %self.config.step_name,
                suborder_id = suborder_id,
                waiting = waiting,
                retrying = retrying,
                "已取消子单的检测步骤"
            );
        }
        removed
    }

    pub fn is_registered(&self, suborder_id: &str) -> bool {
        self.channels.lock().contains_key(suborder_id)
    }

    /// 步骤所属的运行是否仍然有效
    fn is_live(&self, meta: &StepMeta) -> bool {
        self.channels
            .lock()
            .get(meta.suborder_id())
            .is_some_and(|channel| channel.rid == meta.rid)
    }

    /// 启动执行循环和重试循环
    pub fn start(
        self: Arc<Self>,
        work_group: Arc<dyn WorkGroup>,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let retry_handle = {
            let executor = Arc::clone(&self);
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move { executor.run_retry_loop(shutdown).await })
        };

        tokio::spawn(async move {
            self.run_dispatch_loop(work_group, shutdown).await;
            retry_handle.abort();
        })
    }

    async fn run_dispatch_loop(
        self: Arc<Self>,
        work_group: Arc<dyn WorkGroup>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(step = %self.config.step_name, "检测步骤执行器启动");
        let handler: Arc<dyn StepResultHandler> = self.clone();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.rate_limiter.acquire() => {}
            }

            let batch = self.wait_list.pop_top_k(default_score, self.config.batch_size);
            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                continue;
            }

            let batch: Vec<StepMeta> = batch.into_iter().filter(|m| self.is_live(m)).collect();
            self.metrics
                .update_wait_list_depth(self.config.step_name, self.wait_list.len());
            if batch.is_empty() {
                continue;
            }

            self.mark_running(&batch).await;

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = work_group.submit(batch, handler.clone()) => {}
            }
        }

        info!(step = %self.config.step_name, "检测步骤执行器已停止");
    }

    async fn run_retry_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                ready = self.retry_queue.next_ready() => {
                    let now = Utc::now();
                    let ready: Vec<StepMeta> = ready
                        .into_iter()
                        .filter(|m| self.is_live(m))
                        .map(|mut m| {
                            m.joined_at = now;
                            m
                        })
                        .collect();
                    self.wait_list.add(ready);
                }
            }
        }
    }

    async fn mark_running(&self, batch: &[StepMeta]) {
        let ids = batch.iter().map(|m| m.step.id.clone()).collect();
        let update = StepUpdate {
            status: Some(DetectStepStatus::Running),
            start_at: Some(Utc::now()),
            end_at: Some(None),
            ..Default::default()
        };
        let filter = StepFilter::by_ids(ids)
            .with_statuses(&[DetectStepStatus::Init, DetectStepStatus::Running]);
        if let Err(e) = self.step_repo.update(&filter, &update).await {
            warn!(step = %self.config.step_name, "标记检测步骤为运行中失败: {}", e);
        }
        self.release_stale(batch.iter()).await;
    }

    /// 写入运行中状态后再次确认运行仍然有效
    ///
    /// 取消总是先移除结果通道再重置运行中的步骤，写入之后才被取消的运行由取消方
    /// 负责重置，写入之前已被取消的运行在这里回到初始状态。
    async fn release_stale<'a>(&self, metas: impl Iterator<Item = &'a StepMeta>) {
        let stale: Vec<String> = metas
            .filter(|m| !self.is_live(m))
            .map(|m| m.step.id.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        let filter = StepFilter::by_ids(stale.clone()).with_statuses(&[DetectStepStatus::Running]);
        match self
            .step_repo
            .update(&filter, &StepUpdate::status(DetectStepStatus::Init))
            .await
        {
            Ok(released) => debug!(
                step = %self.config.step_name,
                released = released,
                "运行已取消，检测步骤回到初始状态"
            ),
            Err(e) => warn!(
                step = %self.config.step_name,
                steps = ?stale,
                "重置已取消的检测步骤失败: {}",
                e
            ),
        }
    }

    /// 只更新仍处于运行中的步骤，被暂停重置的步骤保持初始状态
    async fn persist(&self, step_id: &str, update: &StepUpdate) {
        let filter = StepFilter::by_ids(vec![step_id.to_string()])
            .with_statuses(&[DetectStepStatus::Running]);
        match self.step_repo.update(&filter, update).await {
            Ok(0) => debug!(step_id = step_id, "检测步骤已不在运行中，忽略结果"),
            Ok(_) => {}
            Err(e) => {
                warn!(step = %self.config.step_name, step_id = step_id, "更新检测步骤失败: {}", e)
            }
        }
    }

    /// 推送最终结果，计数归零时关闭并移除通道
    fn deliver(&self, meta: &StepMeta, result: StepResult) {
        let mut channels = self.channels.lock();
        let suborder_id = meta.suborder_id();
        let finished = match channels.get_mut(suborder_id) {
            Some(channel) if channel.rid == meta.rid => {
                if channel.sender.send(result).is_err() {
                    debug!(suborder_id = suborder_id, "结果接收方已关闭");
                }
                channel.remaining = channel.remaining.saturating_sub(1);
                channel.remaining == 0
            }
            _ => {
                debug!(suborder_id = suborder_id, step_id = %meta.step.id, "丢弃过期的检测结果");
                false
            }
        };
        if finished {
            channels.remove(suborder_id);
        }
    }
}

#[async_trait]
impl StepResultHandler for StepExecutor {
    async fn handle_result(
        &self,
        steps: Vec<StepMeta>,
        error: Option<String>,
        log: String,
        need_retry: bool,
    ) {
        for mut meta in steps {
            if !self.is_live(&meta) {
                debug!(
                    step_id = %meta.step.id,
                    rid = %meta.rid,
                    "子单已完成或已取消，丢弃检测结果"
                );
                continue;
            }

            if error.is_some() && need_retry && meta.retry_times < self.config.max_retry_times {
                meta.retry_times += 1;
                let update = StepUpdate {
                    status: Some(DetectStepStatus::Running),
                    retry_time: Some(meta.retry_times),
                    message: error.clone(),
                    log: Some(log.clone()),
                    ..Default::default()
                };
                self.persist(&meta.step.id, &update).await;
                if !self.is_live(&meta) {
                    self.release_stale(std::iter::once(&meta)).await;
                    continue;
                }
                self.metrics.record_step_retry(self.config.step_name);
                StructuredLogger::log_step_retry(
                    meta.suborder_id(),
                    &meta.step.id,
                    self.config.step_name,
                    meta.retry_times,
                );
                self.retry_queue.schedule(meta, self.config.retry_delay());
                continue;
            }

            let status = if error.is_none() {
                DetectStepStatus::Success
            } else {
                DetectStepStatus::Failed
            };
            let update = StepUpdate {
                status: Some(status),
                retry_time: Some(meta.retry_times),
                message: Some(error.clone().unwrap_or_default()),
                log: Some(log.clone()),
                end_at: Some(Some(Utc::now())),
                ..Default::default()
            };
            self.persist(&meta.step.id, &update).await;
            StructuredLogger::log_step_finished(
                meta.suborder_id(),
                &meta.step.id,
                self.config.step_name,
                meta.retry_times + 1,
                error.as_deref(),
            );

            let result = StepResult {
                step_name: self.config.step_name,
                step_id: meta.step.id.clone(),
                task_id: meta.step.task_id.clone(),
                host_id: meta.step.host_id,
                error: error.clone(),
            };
            self.deliver(&meta, result);
        }
    }
}
