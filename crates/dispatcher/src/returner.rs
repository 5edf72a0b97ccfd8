//! 退回阶段：向资源退回平台提交退回单并跟踪其状态
//!
//! 每个子单有且只有一个退回任务。任务处于 `Init` 时才会向平台创建退回单，
//! 创建成功后记录外部单号并进入 `Running`，此后只做状态查询。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use recycler_core::models::{
    HostFilter, HostUpdate, RecycleHost, RecycleOrder, RecycleStatus, ReturnTask,
    ReturnTaskStatus, ReturnTaskUpdate,
};
use recycler_core::{
    RecyclerError, RecyclerResult, Repositories, ReturnProvider, ReturnState, ReturnerConfig,
};

/// 一次退回处理的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnOutcome {
    Success,
    Failed(String),
    /// 外部退回单仍在执行，稍后再查询
    Running,
}

/// 退回阶段接口
#[async_trait]
pub trait ReturnPhase: Send + Sync {
    /// 创建（如尚未创建）并跟踪退回单
    async fn return_hosts(&self, order: &RecycleOrder) -> RecyclerResult<ReturnOutcome>;

    /// 查询一次已创建的退回单状态
    async fn query(&self, order: &RecycleOrder) -> RecyclerResult<ReturnOutcome>;

    /// 登记延迟退回计划
    async fn plan(&self, order: &RecycleOrder) -> RecyclerResult<()>;

    /// 清除失败的退回任务，下次处理时重新创建退回单
    async fn reset(&self, order: &RecycleOrder) -> RecyclerResult<()>;
}

pub struct ProviderReturner {
    repos: Repositories,
    provider: Arc<dyn ReturnProvider>,
    config: ReturnerConfig,
}

impl ProviderReturner {
    pub fn new(
        repos: Repositories,
        provider: Arc<dyn ReturnProvider>,
        config: Option<ReturnerConfig>,
    ) -> Self {
        Self {
            repos,
            provider,
            config: config.unwrap_or_default(),
        }
    }

    async fn load_or_create_task(&self, order: &RecycleOrder) -> RecyclerResult<ReturnTask> {
        if let Some(task) = self.repos.return_tasks.get(&order.suborder_id).await? {
            return Ok(task);
        }
        let task = ReturnTask::new(&order.suborder_id, order.resource_type);
        self.repos.return_tasks.create(&task).await?;
        Ok(task)
    }

    async fn returnable_hosts(&self, suborder_id: &str) -> RecyclerResult<Vec<RecycleHost>> {
        Ok(self
            .repos
            .hosts
            .find(&HostFilter::by_suborder(suborder_id))
            .await?
            .into_iter()
            .filter(|h| h.status != RecycleStatus::DetectFailed && !h.status.is_terminal())
            .collect())
    }

    async fn create_return_order(
        &self,
        order: &RecycleOrder,
        task: &mut ReturnTask,
    ) -> RecyclerResult<()> {
        let suborder_id = order.suborder_id.as_str();
        let hosts = self.returnable_hosts(suborder_id).await?;
        let host_ids: Vec<i64> = hosts.iter().map(|h| h.host_id).collect();

        self.repos
            .hosts
            .update(
                &HostFilter::by_suborder(suborder_id).with_host_ids(host_ids.clone()),
                &HostUpdate::status(RecycleStatus::Returning),
            )
            .await?;

        let created = self.provider.create_return_order(order, &hosts).await?;
        self.repos
            .return_tasks
            .update(
                suborder_id,
                &ReturnTaskUpdate {
                    status: Some(ReturnTaskStatus::Running),
                    task_id: Some(created.task_id.clone()),
                    task_link: Some(created.link.clone()),
                    message: Some(String::new()),
                },
            )
            .await?;

        let host_update = HostUpdate {
            return_id: Some(created.task_id.clone()),
            return_link: Some(created.link.clone()),
            ..Default::default()
        };
        if let Err(e) = self
            .repos
            .hosts
            .update(
                &HostFilter::by_suborder(suborder_id).with_host_ids(host_ids),
                &host_update,
            )
            .await
        {
            warn!(suborder_id = suborder_id, "回写主机退回单号失败: {}", e);
        }

        info!(
            suborder_id = suborder_id,
            task_id = %created.task_id,
            hosts = hosts.len(),
            "退回单已创建"
        );
        task.status = ReturnTaskStatus::Running;
        task.task_id = created.task_id;
        task.task_link = created.link;
        Ok(())
    }

    /// 查询一次外部状态，终态写回退回任务
    async fn poll_once(&self, suborder_id: &str, task_id: &str) -> RecyclerResult<ReturnOutcome> {
        let outcome = match self.provider.query_return_status(task_id).await? {
            ReturnState::Running => return Ok(ReturnOutcome::Running),
            ReturnState::Success => ReturnOutcome::Success,
            ReturnState::Failed(msg) => ReturnOutcome::Failed(msg),
        };
        let update = match &outcome {
            ReturnOutcome::Failed(msg) => ReturnTaskUpdate {
                status: Some(ReturnTaskStatus::Failed),
                message: Some(msg.clone()),
                ..Default::default()
            },
            _ => ReturnTaskUpdate {
                status: Some(ReturnTaskStatus::Success),
                ..Default::default()
            },
        };
        self.repos.return_tasks.update(suborder_id, &update).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl ReturnPhase for ProviderReturner {
    async fn return_hosts(&self, order: &RecycleOrder) -> RecyclerResult<ReturnOutcome> {
        let suborder_id = order.suborder_id.as_str();
        let mut task = self.load_or_create_task(order).await?;

        match task.status {
            ReturnTaskStatus::Success => return Ok(ReturnOutcome::Success),
            ReturnTaskStatus::Failed => return Ok(ReturnOutcome::Failed(task.message)),
            ReturnTaskStatus::Init | ReturnTaskStatus::Paused if task.task_id.is_empty() => {
                self.create_return_order(order, &mut task).await?;
            }
            _ => {}
        }

        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        for attempt in 0..self.config.max_polls {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            match self.poll_once(suborder_id, &task.task_id).await? {
                ReturnOutcome::Running => continue,
                done => return Ok(done),
            }
        }
        info!(
            suborder_id = suborder_id,
            task_id = %task.task_id,
            "退回单仍在执行，稍后继续查询"
        );
        Ok(ReturnOutcome::Running)
    }

    async fn query(&self, order: &RecycleOrder) -> RecyclerResult<ReturnOutcome> {
        let suborder_id = order.suborder_id.as_str();
        let task = self
            .repos
            .return_tasks
            .get(suborder_id)
            .await?
            .ok_or_else(|| RecyclerError::Internal(format!("回收单 {suborder_id} 没有退回任务")))?;
        match task.status {
            ReturnTaskStatus::Success => Ok(ReturnOutcome::Success),
            ReturnTaskStatus::Failed => Ok(ReturnOutcome::Failed(task.message)),
            _ if task.task_id.is_empty() => Err(RecyclerError::Internal(format!(
                "回收单 {suborder_id} 的退回单尚未创建"
            ))),
            _ => self.poll_once(suborder_id, &task.task_id).await,
        }
    }

    async fn plan(&self, order: &RecycleOrder) -> RecyclerResult<()> {
        let hosts = self.returnable_hosts(&order.suborder_id).await?;
        self.provider.schedule_return_plan(order, &hosts).await?;
        info!(
            suborder_id = %order.suborder_id,
            hosts = hosts.len(),
            "已登记延迟退回计划"
        );
        Ok(())
    }

    async fn reset(&self, order: &RecycleOrder) -> RecyclerResult<()> {
        let suborder_id = order.suborder_id.as_str();
        let Some(task) = self.repos.return_tasks.get(suborder_id).await? else {
            return Ok(());
        };
        if task.status != ReturnTaskStatus::Failed {
            return Ok(());
        }

        self.repos
            .return_tasks
            .update(
                suborder_id,
                &ReturnTaskUpdate {
                    status: Some(ReturnTaskStatus::Init),
                    task_id: Some(String::new()),
                    task_link: Some(String::new()),
                    message: Some(String::new()),
                },
            )
            .await?;
        info!(
            suborder_id = suborder_id,
            previous_task_id = %task.task_id,
            "退回任务已重置，将重新创建退回单"
        );
        Ok(())
    }
}
