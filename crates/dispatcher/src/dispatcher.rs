//! 回收单分发器
//!
//! 分发器持有一个去重的子单队列，后台循环按子单当前状态调用检测、转移、
//! 退回阶段，并把阶段结果作为事件交给状态机。状态写入带当前状态作为过滤条件，
//! 并发流转时只有一个写入会生效。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use recycler_core::models::{
    HostFilter, HostUpdate, OrderFilter, OrderUpdate, RecycleHost, RecycleOrder, RecycleStatus,
};
use recycler_core::{DispatcherConfig, OrderMetrics, RecyclerError, RecyclerResult, Repositories};
use recycler_detector::Detector;
use recycler_infrastructure::StructuredLogger;

use crate::returner::{ReturnOutcome, ReturnPhase};
use crate::state_machine::{
    host_statuses_to_sync, Action, Guard, OrderEvent, OrderStateMachine, Transition,
};
use crate::transit::TransitPhase;
use crate::work_queue::WorkQueue;

pub struct Dispatcher {
    repos: Repositories,
    state_machine: OrderStateMachine,
    detector: Arc<Detector>,
    transit: Arc<dyn TransitPhase>,
    returner: Arc<dyn ReturnPhase>,
    queue: Arc<WorkQueue>,
    config: DispatcherConfig,
    metrics: Arc<dyn OrderMetrics>,
}

impl Dispatcher {
    pub fn new(
        repos: Repositories,
        detector: Arc<Detector>,
        transit: Arc<dyn TransitPhase>,
        returner: Arc<dyn ReturnPhase>,
        metrics: Arc<dyn OrderMetrics>,
        config: Option<DispatcherConfig>,
    ) -> RecyclerResult<Self> {
        Ok(Self {
            repos,
            state_machine: OrderStateMachine::new()?,
            detector,
            transit,
            returner,
            queue: Arc::new(WorkQueue::new()),
            config: config.unwrap_or_default(),
            metrics,
        })
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    pub fn transit(&self) -> &Arc<dyn TransitPhase> {
        &self.transit
    }

    pub fn returner(&self) -> &Arc<dyn ReturnPhase> {
        &self.returner
    }

    pub fn metrics(&self) -> &Arc<dyn OrderMetrics> {
        &self.metrics
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// 放入分发队列
    pub fn enqueue(&self, suborder_id: &str) {
        if self.queue.push(suborder_id) {
            debug!(suborder_id = suborder_id, "回收单已入队");
        }
    }

    fn enqueue_after(&self, suborder_id: &str, delay: Duration) {
        let queue = self.queue.clone();
        let suborder_id = suborder_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(&suborder_id);
        });
    }

    /// 新建回收单及其主机，回收单处于未提交状态
    pub async fn create_order(
        &self,
        mut order: RecycleOrder,
        hosts: Vec<RecycleHost>,
    ) -> RecyclerResult<()> {
        if order.status != RecycleStatus::Uncommit {
            return Err(RecyclerError::IllegalTransition {
                from: order.status,
                event: "Create".to_string(),
            });
        }
        if let Some(host) = hosts.iter().find(|h| h.suborder_id != order.suborder_id) {
            return Err(RecyclerError::Internal(format!(
                "主机 {} 不属于回收单 {}",
                host.host_id, order.suborder_id
            )));
        }

        order.stage = order.status.stage();
        order.total_num = hosts.len() as u64;
        order.pending_num = hosts.len() as u64;
        order.success_num = 0;
        order.failed_num = 0;
        self.repos.orders.create(&order).await?;
        if !hosts.is_empty() {
            self.repos.hosts.create_many(&hosts).await?;
        }
        info!(
            suborder_id = %order.suborder_id,
            hosts = hosts.len(),
            "回收单已创建"
        );
        Ok(())
    }

    /// 提交回收单，返回成功提交的数量
    pub async fn start_orders(&self, suborder_ids: &[String]) -> RecyclerResult<usize> {
        let mut started = 0;
        for suborder_id in suborder_ids {
            match self.fire(suborder_id, OrderEvent::Submit, "已提交").await {
                Ok(Some(_)) => started += 1,
                Ok(None) => {}
                Err(e @ RecyclerError::IllegalTransition { .. }) => {
                    warn!(suborder_id = %suborder_id, "回收单无法提交: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    pub async fn audit_order(
        &self,
        suborder_id: &str,
        approve: bool,
        message: &str,
    ) -> RecyclerResult<Option<RecycleStatus>> {
        let event = if approve {
            OrderEvent::AuditApprove
        } else {
            OrderEvent::AuditReject
        };
        self.fire(suborder_id, event, message).await
    }

    pub async fn pause_order(&self, suborder_id: &str) -> RecyclerResult<Option<RecycleStatus>> {
        self.fire(suborder_id, OrderEvent::Pause, "已暂停").await
    }

    pub async fn resume_order(&self, suborder_id: &str) -> RecyclerResult<Option<RecycleStatus>> {
        self.fire(suborder_id, OrderEvent::Resume, "已恢复").await
    }

    /// 修正回收单：移除检测失败的主机后重新检测
    pub async fn revise_order(&self, suborder_id: &str) -> RecyclerResult<Option<RecycleStatus>> {
        self.fire(suborder_id, OrderEvent::Revise, "已修正").await
    }

    pub async fn terminate_order(
        &self,
        suborder_id: &str,
    ) -> RecyclerResult<Option<RecycleStatus>> {
        self.fire(suborder_id, OrderEvent::Terminate, "已终止").await
    }

    /// 向状态机投递事件，返回最终到达的状态；状态已被其他流程改变时返回 `None`
    pub async fn fire(
        &self,
        suborder_id: &str,
        event: OrderEvent,
        message: &str,
    ) -> RecyclerResult<Option<RecycleStatus>> {
        self.apply_event(suborder_id, None, event, message.to_string())
            .await
    }

    /// 仅当回收单仍处于 `expected` 时投递事件
    pub async fn fire_from(
        &self,
        suborder_id: &str,
        expected: RecycleStatus,
        event: OrderEvent,
        message: &str,
    ) -> RecyclerResult<Option<RecycleStatus>> {
        self.apply_event(suborder_id, Some(expected), event, message.to_string())
            .await
    }

    async fn apply_event(
        &self,
        suborder_id: &str,
        mut expected: Option<RecycleStatus>,
        event: OrderEvent,
        message: String,
    ) -> RecyclerResult<Option<RecycleStatus>> {
        let mut next = Some((event, message));
        let mut reached = None;

        while let Some((event, message)) = next.take() {
            let mut order = self.load(suborder_id).await?;
            if let Some(expected) = expected.take() {
                if order.status != expected {
                    debug!(
                        suborder_id = suborder_id,
                        "回收单状态已从 {} 变为 {}，忽略事件 {}",
                        expected,
                        order.status,
                        event
                    );
                    return Ok(reached);
                }
            }

            let transition = self.state_machine.resolve(&order, event)?;
            let applied = self
                .repos
                .orders
                .update(
                    &OrderFilter::by_suborder(suborder_id).with_statuses(&[transition.from]),
                    &OrderUpdate::status(transition.to, message),
                )
                .await?;
            if applied == 0 {
                info!(
                    suborder_id = suborder_id,
                    "回收单已不处于 {}，事件 {} 未生效",
                    transition.from,
                    event
                );
                return Ok(reached);
            }

            self.sync_hosts(suborder_id, &transition).await;
            StructuredLogger::log_order_transition(
                suborder_id,
                transition.from,
                event.as_str(),
                transition.to,
            );
            self.metrics
                .record_order_transition(transition.from, transition.to);

            order.status = transition.to;
            order.stage = transition.to.stage();
            reached = Some(transition.to);
            next = self.run_action(&order, &transition).await?;
            // 追加事件只在刚到达的状态上生效
            expected = Some(transition.to);
        }
        Ok(reached)
    }

    async fn run_action(
        &self,
        order: &RecycleOrder,
        transition: &Transition,
    ) -> RecyclerResult<Option<(OrderEvent, String)>> {
        let suborder_id = order.suborder_id.as_str();
        match transition.action {
            Action::None => {}
            Action::Enqueue => self.enqueue(suborder_id),
            Action::EnterAudit => {
                if Guard::SkipConfirm.check(order) {
                    return Ok(Some((OrderEvent::AuditApprove, "跳过审核".to_string())));
                }
            }
            Action::PauseDetect => self.detector.pause(suborder_id).await?,
            Action::ReviseDetect => {
                let removed = self.detector.remove_failed_hosts(suborder_id).await?;
                info!(suborder_id = suborder_id, removed = removed, "已移除检测失败的主机");
                self.enqueue(suborder_id);
            }
            Action::CancelAll => self.detector.cancel(suborder_id),
            Action::RetryReturn => {
                self.returner.reset(order).await?;
                self.enqueue(suborder_id);
            }
        }
        Ok(None)
    }

    /// 主机状态跟随回收单，检测/转移/退回阶段的主机状态由阶段自己维护
    async fn sync_hosts(&self, suborder_id: &str, transition: &Transition) {
        let Some(statuses) = host_statuses_to_sync(transition.to) else {
            return;
        };
        if let Err(e) = self
            .repos
            .hosts
            .update(
                &HostFilter::by_suborder(suborder_id).with_statuses(&statuses),
                &HostUpdate::status(transition.to),
            )
            .await
        {
            warn!(suborder_id = suborder_id, "同步主机状态失败: {}", e);
        }
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

    /// 按回收单当前状态执行对应阶段
    pub async fn deal_order(&self, suborder_id: &str) -> RecyclerResult<()> {
        let Some(order) = self.repos.orders.get(suborder_id).await? else {
            warn!(suborder_id = suborder_id, "回收单不存在，跳过处理");
            return Ok(());
        };
        let status = order.status;
        debug!(suborder_id = suborder_id, status = %status, "处理回收单");

        match status {
            RecycleStatus::Committed => match self.detector.prepare(&order).await {
                Ok(created) => {
                    let msg = format!("已创建 {created} 个检测任务");
                    self.fire_from(suborder_id, status, OrderEvent::CommitSuccess, &msg)
                        .await?;
                }
                Err(e) => {
                    error!(suborder_id = suborder_id, "准备检测任务失败: {}", e);
                    self.fire_from(suborder_id, status, OrderEvent::CommitFailed, &e.to_string())
                        .await?;
                }
            },
            RecycleStatus::Detecting => {
                match self.detector.detect(&order).await {
                    Ok(_) => {}
                    Err(RecyclerError::StepAlreadyRunning { step_id }) => {
                        let delay = Duration::from_secs(self.config.requeue_delay_seconds);
                        info!(
                            suborder_id = suborder_id,
                            step_id = %step_id,
                            delay_seconds = delay.as_secs(),
                            "检测步骤仍在运行，稍后重新入队"
                        );
                        self.enqueue_after(suborder_id, delay);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                self.finish_detect(suborder_id).await?;
            }
            RecycleStatus::Transiting => match self.transit.transit(&order).await {
                Ok(()) => {
                    self.fire_from(suborder_id, status, OrderEvent::TransitSuccess, "转移完成")
                        .await?;
                }
                Err(e) => {
                    error!(suborder_id = suborder_id, "主机转移失败: {}", e);
                    self.fire_from(suborder_id, status, OrderEvent::TransitFailed, &e.to_string())
                        .await?;
                }
            },
            RecycleStatus::Returning => {
                let outcome = match self.returner.return_hosts(&order).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(suborder_id = suborder_id, "退回失败: {}", e);
                        ReturnOutcome::Failed(e.to_string())
                    }
                };
                self.apply_return_outcome(suborder_id, status, outcome).await?;
            }
            RecycleStatus::ReturningPlan => match self.returner.plan(&order).await {
                Ok(()) => {
                    self.fire_from(suborder_id, status, OrderEvent::ReturnSuccess, "已登记延迟退回")
                        .await?;
                }
                Err(e) => {
                    error!(suborder_id = suborder_id, "登记延迟退回失败: {}", e);
                    self.fire_from(suborder_id, status, OrderEvent::ReturnFailed, &e.to_string())
                        .await?;
                }
            },
            _ => {
                debug!(suborder_id = suborder_id, status = %status, "当前状态无需处理");
            }
        }
        Ok(())
    }

    /// 根据检测结果投递检测成功或失败事件
    pub async fn finish_detect(&self, suborder_id: &str) -> RecyclerResult<()> {
        // 检测期间被终止或暂停时不再回写计数
        match self.repos.orders.get(suborder_id).await? {
            Some(order) if order.status == RecycleStatus::Detecting => {}
            Some(order) => {
                debug!(
                    suborder_id = suborder_id,
                    status = %order.status,
                    "回收单已离开检测状态，跳过检测结果汇总"
                );
                return Ok(());
            }
            None => return Ok(()),
        }
        match self.detector.check_detect_status(suborder_id).await {
            Ok(()) => {
                self.fire_from(
                    suborder_id,
                    RecycleStatus::Detecting,
                    OrderEvent::DetectSuccess,
                    "检测通过",
                )
                .await?;
            }
            Err(RecyclerError::DetectNotPassed { failed, .. }) => {
                let msg = format!("{failed} 台主机检测未通过");
                self.fire_from(
                    suborder_id,
                    RecycleStatus::Detecting,
                    OrderEvent::DetectFailed,
                    &msg,
                )
                .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// 把退回结果投递给状态机，退回单仍在执行时延迟重新入队
    pub async fn apply_return_outcome(
        &self,
        suborder_id: &str,
        expected: RecycleStatus,
        outcome: ReturnOutcome,
    ) -> RecyclerResult<()> {
        match outcome {
            ReturnOutcome::Success => {
                self.fire_from(suborder_id, expected, OrderEvent::ReturnSuccess, "退回完成")
                    .await?;
            }
            ReturnOutcome::Failed(msg) => {
                self.fire_from(suborder_id, expected, OrderEvent::ReturnFailed, &msg)
                    .await?;
            }
            ReturnOutcome::Running => {
                self.enqueue_after(
                    suborder_id,
                    Duration::from_secs(self.config.requeue_delay_seconds),
                );
            }
        }
        Ok(())
    }

    /// 启动分发循环
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_orders));
            info!(
                "回收单分发器已启动，最大并发 {}",
                self.config.max_concurrent_orders
            );

            loop {
                let permit = tokio::select! {
                    _ = shutdown.recv() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let suborder_id = tokio::select! {
                    _ = shutdown.recv() => break,
                    id = self.queue.pop() => id,
                };

                let this = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = AssertUnwindSafe(this.deal_order(&suborder_id))
                        .catch_unwind()
                        .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(suborder_id = %suborder_id, "处理回收单失败: {}", e);
                        }
                        Err(_) => {
                            error!(suborder_id = %suborder_id, "处理回收单时发生panic");
                        }
                    }
                    this.queue.done(&suborder_id);
                });
            }

            info!("回收单分发器已停止");
        })
    }
}
