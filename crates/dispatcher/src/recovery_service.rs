use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use recycler_core::models::{
    DetectTaskFilter, DetectTaskStatus, HostFilter, OrderFilter, RecycleOrder, RecycleStatus,
    ReturnTaskStatus,
};
use recycler_core::{
    LeaderElector, RecoveryConfig, RecyclerError, RecyclerResult, Repositories,
};
use recycler_infrastructure::StructuredLogger;

use crate::dispatcher::Dispatcher;
use crate::returner::ReturnOutcome;
use crate::state_machine::OrderEvent;

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 恢复时间窗口内所有滞留在中间状态的回收单
    async fn recover_system_state(&self) -> RecyclerResult<RecoveryReport>;

    /// 按当前持久化状态恢复单个回收单，重复执行结果不变
    async fn recover_order(&self, suborder_id: &str) -> RecyclerResult<RecoveryAction>;
}

/// 单个回收单的恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新放入分发队列
    Enqueued,
    /// 重放阶段结果事件
    Replayed,
    /// 外部处理仍在进行，稍后再查询
    Waiting,
    /// 无需恢复
    Skipped,
}

impl RecoveryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Enqueued => "enqueued",
            RecoveryAction::Replayed => "replayed",
            RecoveryAction::Waiting => "waiting",
            RecoveryAction::Skipped => "skipped",
        }
    }
}

/// 恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: Vec<(String, RecoveryAction)>,
    pub errors: Vec<String>,
    pub recovery_duration_ms: u64,
}

impl RecoveryReport {
    pub fn count(&self, action: RecoveryAction) -> usize {
        self.recovered.iter().filter(|(_, a)| *a == action).count()
    }
}

/// 恢复服务实现
#[derive(Clone)]
pub struct SystemRecoveryService {
    repos: Repositories,
    dispatcher: Arc<Dispatcher>,
    leader: Arc<dyn LeaderElector>,
    config: RecoveryConfig,
}

impl SystemRecoveryService {
    /// 创建新的恢复服务
    pub fn new(
        repos: Repositories,
        dispatcher: Arc<Dispatcher>,
        leader: Arc<dyn LeaderElector>,
        config: Option<RecoveryConfig>,
    ) -> Self {
        Self {
            repos,
            dispatcher,
            leader,
            config: config.unwrap_or_default(),
        }
    }

    /// 后台执行一次恢复：先等待成为主节点
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("恢复服务未启用");
                return;
            }

            let interval = Duration::from_secs(self.config.master_poll_interval_seconds);
            while !self.leader.is_master().await {
                debug!("当前节点不是主节点，{}秒后重试", interval.as_secs());
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("恢复过程被关闭信号中断");
                }
                result = self.recover_system_state() => match result {
                    Ok(report) => info!(
                        "恢复完成: 扫描 {} 个回收单，重新入队 {} 个，重放 {} 个，等待 {} 个，失败 {} 个，耗时 {}ms",
                        report.scanned,
                        report.count(RecoveryAction::Enqueued),
                        report.count(RecoveryAction::Replayed),
                        report.count(RecoveryAction::Waiting),
                        report.errors.len(),
                        report.recovery_duration_ms
                    ),
                    Err(e) => {
                        StructuredLogger::log_system_error("recovery", "recover_system_state", &e);
                    }
                }
            }
        })
    }

    async fn load(&self, suborder_id: &str) -> RecyclerResult<RecycleOrder> {
        self.repos
            .orders
            .get(suborder_id)
            .await?
            .ok_or_else(|| RecyclerError::OrderNotFound {
                suborder_id: suborder_id.to_string(),
            })
    }

    /// 提交后尚未建出检测任务的回收单重新入队，否则补投提交成功事件
    async fn recover_committed(&self, order: &RecycleOrder) -> RecyclerResult<RecoveryAction> {
        let init_tasks = self
            .repos
            .detect_tasks
            .count(
                &DetectTaskFilter::by_suborder(&order.suborder_id)
                    .with_statuses(&[DetectTaskStatus::Init]),
            )
            .await?;
        if init_tasks == 0 {
            self.dispatcher.enqueue(&order.suborder_id);
            return Ok(RecoveryAction::Enqueued);
        }
        self.dispatcher
            .fire_from(
                &order.suborder_id,
                RecycleStatus::Committed,
                OrderEvent::CommitSuccess,
                "恢复: 检测任务已创建",
            )
            .await?;
        Ok(RecoveryAction::Replayed)
    }

    /// 没有主机处于检测中说明检测尚未开始，重新入队；否则继续检测并投递结果
    async fn recover_detecting(&self, order: &RecycleOrder) -> RecyclerResult<RecoveryAction> {
        let detecting = self
            .repos
            .hosts
            .count(
                &HostFilter::by_suborder(&order.suborder_id)
                    .with_statuses(&[RecycleStatus::Detecting]),
            )
            .await?;
        if detecting == 0 {
            self.dispatcher.enqueue(&order.suborder_id);
            return Ok(RecoveryAction::Enqueued);
        }

        match self.dispatcher.detector().resume(order).await {
            Ok(_) => {}
            Err(RecyclerError::StepAlreadyRunning { step_id }) => {
                info!(
                    suborder_id = %order.suborder_id,
                    step_id = %step_id,
                    "检测步骤仍在运行，等待其结束"
                );
                return Ok(RecoveryAction::Waiting);
            }
            Err(e) => return Err(e),
        }
        self.dispatcher.finish_detect(&order.suborder_id).await?;
        Ok(RecoveryAction::Replayed)
    }

    async fn recover_transiting(&self, order: &RecycleOrder) -> RecyclerResult<RecoveryAction> {
        let transiting = self
            .repos
            .hosts
            .count(
                &HostFilter::by_suborder(&order.suborder_id)
                    .with_statuses(&[RecycleStatus::Transiting]),
            )
            .await?;
        if transiting == 0 {
            self.dispatcher.enqueue(&order.suborder_id);
            return Ok(RecoveryAction::Enqueued);
        }

        let (event, message) = match self.dispatcher.transit().resume(order).await {
            Ok(()) => (OrderEvent::TransitSuccess, "恢复: 转移完成".to_string()),
            Err(e) => {
                warn!(suborder_id = %order.suborder_id, "恢复转移失败: {}", e);
                (OrderEvent::TransitFailed, e.to_string())
            }
        };
        self.dispatcher
            .fire_from(&order.suborder_id, RecycleStatus::Transiting, event, &message)
            .await?;
        Ok(RecoveryAction::Replayed)
    }

    async fn recover_returning(&self, order: &RecycleOrder) -> RecyclerResult<RecoveryAction> {
        let Some(task) = self.repos.return_tasks.get(&order.suborder_id).await? else {
            self.dispatcher.enqueue(&order.suborder_id);
            return Ok(RecoveryAction::Enqueued);
        };

        let outcome = match task.status {
            ReturnTaskStatus::Init | ReturnTaskStatus::Paused => {
                self.dispatcher.enqueue(&order.suborder_id);
                return Ok(RecoveryAction::Enqueued);
            }
            ReturnTaskStatus::Running => self.dispatcher.returner().query(order).await?,
            ReturnTaskStatus::Success => ReturnOutcome::Success,
            ReturnTaskStatus::Failed => ReturnOutcome::Failed(task.message),
        };
        let action = if outcome == ReturnOutcome::Running {
            RecoveryAction::Waiting
        } else {
            RecoveryAction::Replayed
        };
        self.dispatcher
            .apply_return_outcome(&order.suborder_id, RecycleStatus::Returning, outcome)
            .await?;
        Ok(action)
    }
}

#[async_trait]
impl RecoveryService for SystemRecoveryService {
    async fn recover_system_state(&self) -> RecyclerResult<RecoveryReport> {
        let started = Instant::now();
        let now = Utc::now();
        let filter = OrderFilter {
            statuses: Some(
                RecycleStatus::ALL
                    .into_iter()
                    .filter(|s| s.is_recoverable())
                    .collect(),
            ),
            created_from: Some(now - chrono::Duration::minutes(self.config.max_stay_minutes)),
            created_before: Some(now - chrono::Duration::minutes(self.config.min_stay_minutes)),
            ..Default::default()
        };
        let orders = self.repos.orders.find(&filter).await?;
        info!("开始恢复回收单，共 {} 个", orders.len());

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut join_set = JoinSet::new();
        for order in &orders {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| RecyclerError::Internal(e.to_string()))?;
            let this = self.clone();
            let suborder_id = order.suborder_id.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = this.recover_order(&suborder_id).await;
                (suborder_id, result)
            });
        }

        let mut report = RecoveryReport {
            scanned: orders.len(),
            ..Default::default()
        };
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((suborder_id, Ok(action))) => report.recovered.push((suborder_id, action)),
                Ok((suborder_id, Err(e))) => {
                    error!(suborder_id = %suborder_id, "恢复回收单失败: {}", e);
                    report.errors.push(format!("{suborder_id}: {e}"));
                }
                Err(e) => {
                    error!("恢复任务异常退出: {}", e);
                    report.errors.push(e.to_string());
                }
            }
        }

        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn recover_order(&self, suborder_id: &str) -> RecyclerResult<RecoveryAction> {
        let order = self.load(suborder_id).await?;
        let status = order.status;
        let result = match status {
            RecycleStatus::Committed => self.recover_committed(&order).await,
            RecycleStatus::Detecting => self.recover_detecting(&order).await,
            RecycleStatus::Transiting => self.recover_transiting(&order).await,
            RecycleStatus::Returning => self.recover_returning(&order).await,
            RecycleStatus::ReturningPlan => self
                .dispatcher
                .deal_order(suborder_id)
                .await
                .map(|_| RecoveryAction::Replayed),
            _ => Ok(RecoveryAction::Skipped),
        };

        match &result {
            Ok(action) => {
                StructuredLogger::log_order_recovered(suborder_id, status, action.as_str());
                self.dispatcher.metrics().record_recovered_order(status, true);
            }
            Err(_) => self.dispatcher.metrics().record_recovered_order(status, false),
        }
        result
    }
}
