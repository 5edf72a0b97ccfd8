//! 检测阶段协调器
//!
//! 负责检测任务和检测步骤的生命周期：为每台主机准备任务、按步骤配置计算需要
//! 新建/重置/跳过的步骤、驱动 `StepRunner` 执行，并把结果汇总到任务、主机和
//! 回收单的计数上。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use recycler_core::models::{
    DetectStep, DetectStepCfg, DetectStepStatus, DetectTask, DetectTaskFilter, DetectTaskStatus,
    HostFilter, HostUpdate, OrderFilter, OrderUpdate, RecycleHost, RecycleOrder, RecycleStatus,
    StepFilter, StepUpdate,
};
use recycler_core::{DetectorConfig, RecyclerError, RecyclerResult, Repositories};

use crate::executor_registry::ExecutorRegistry;
use crate::step_runner::{StepBatch, StepRunner};
use crate::wait_list::StepMeta;

const DETECT_TASK_SEQUENCE: &str = "detect_task";

/// 一次检测运行的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectSummary {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub pending: u64,
}

impl DetectSummary {
    fn from_tasks<'a>(tasks: impl Iterator<Item = &'a DetectTask>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            summary.total += 1;
            match task.status {
                DetectTaskStatus::Success => summary.success += 1,
                DetectTaskStatus::Failed => summary.failed += 1,
                _ => summary.pending += 1,
            }
        }
        summary
    }

    pub fn passed(&self) -> bool {
        self.failed == 0 && self.pending == 0
    }
}

/// 单个步骤在本次运行中的处理方式
enum StepPlan {
    Create(DetectStep),
    Reset(DetectStep),
    Skip(DetectStep),
}

pub struct Detector {
    repos: Repositories,
    registry: Arc<ExecutorRegistry>,
    runner: StepRunner,
    config: DetectorConfig,
}

impl Detector {
    pub fn new(
        repos: Repositories,
        registry: Arc<ExecutorRegistry>,
        config: Option<DetectorConfig>,
    ) -> Self {
        Self {
            repos,
            runner: StepRunner::new(registry.clone()),
            registry,
            config: config.unwrap_or_default(),
        }
    }

    /// 为尚无检测任务的主机创建初始任务，返回新建数量
    pub async fn prepare(&self, order: &RecycleOrder) -> RecyclerResult<usize> {
        let hosts = self
            .repos
            .hosts
            .find(&HostFilter::by_suborder(&order.suborder_id))
            .await?;
        let existing = self
            .repos
            .detect_tasks
            .find(&DetectTaskFilter::by_suborder(&order.suborder_id))
            .await?;
        let created = self.create_missing_tasks(&order.suborder_id, &hosts, &existing).await?;
        Ok(created.len())
    }

    async fn create_missing_tasks(
        &self,
        suborder_id: &str,
        hosts: &[RecycleHost],
        existing: &[DetectTask],
    ) -> RecyclerResult<Vec<DetectTask>> {
        let known: HashSet<i64> = existing.iter().map(|t| t.host_id).collect();
        let mut created = Vec::new();
        for host in hosts.iter().filter(|h| !known.contains(&h.host_id)) {
            let seq = self
                .repos
                .detect_tasks
                .next_sequence(DETECT_TASK_SEQUENCE)
                .await?;
            created.push(DetectTask::new(
                format!("DT{seq:010}"),
                suborder_id,
                host.host_id,
                &host.ip,
                &host.asset_id,
            ));
        }
        if !created.is_empty() {
            self.repos.detect_tasks.create_many(&created).await?;
            debug!(suborder_id = suborder_id, count = created.len(), "已创建检测任务");
        }
        Ok(created)
    }

    /// 执行一次完整的检测
    pub async fn detect(&self, order: &RecycleOrder) -> RecyclerResult<DetectSummary> {
        let suborder_id = order.suborder_id.as_str();
        let cfgs = self.repos.step_cfgs.find_enabled().await?;

        let hosts = self
            .repos
            .hosts
            .find(&HostFilter::by_suborder(suborder_id))
            .await?;
        let mut tasks = self
            .repos
            .detect_tasks
            .find(&DetectTaskFilter::by_suborder(suborder_id))
            .await?;
        let created = self.create_missing_tasks(suborder_id, &hosts, &tasks).await?;
        tasks.extend(created);

        let existing_steps: HashMap<String, DetectStep> = self
            .repos
            .detect_steps
            .find(&StepFilter::by_suborder(suborder_id))
            .await?
            .into_iter()
            .map(|step| (step.id.clone(), step))
            .collect();

        let plans = Self::plan_steps(&cfgs, &tasks, &existing_steps)?;

        for task in tasks.iter_mut() {
            task.reset_for_run(cfgs.len() as u64);
        }
        self.persist_plan(suborder_id, &tasks, &plans).await?;

        let host_ids: Vec<i64> = tasks.iter().map(|t| t.host_id).collect();
        self.repos
            .hosts
            .update(
                &HostFilter::by_suborder(suborder_id).with_host_ids(host_ids),
                &HostUpdate::status(RecycleStatus::Detecting),
            )
            .await?;
        self.write_order_counts(suborder_id, &DetectSummary::from_tasks(tasks.iter()))
            .await;

        let mut tasks_by_id: HashMap<String, DetectTask> = tasks
            .into_iter()
            .map(|task| (task.task_id.clone(), task))
            .collect();

        if cfgs.is_empty() {
            for task in tasks_by_id.values_mut() {
                task.status = DetectTaskStatus::Success;
            }
            let all: Vec<DetectTask> = tasks_by_id.values().cloned().collect();
            self.repos.detect_tasks.save_progress(&all).await?;
            let summary = DetectSummary::from_tasks(tasks_by_id.values());
            self.write_order_counts(suborder_id, &summary).await;
            return Ok(summary);
        }

        let rid = Uuid::new_v4().to_string();
        let batches = Self::build_batches(&cfgs, plans, &tasks_by_id);
        info!(
            suborder_id = suborder_id,
            rid = %rid,
            hosts = tasks_by_id.len(),
            steps = cfgs.len(),
            "开始检测"
        );

        let mut stream = self
            .runner
            .run(suborder_id, &rid, batches, tasks_by_id.len())?;
        let window = Duration::from_millis(self.config.result_batch_window_ms);

        while let Some(results) = stream
            .recv_batch(self.config.result_batch_size, window)
            .await
        {
            let mut dirty: HashSet<String> = HashSet::new();
            let mut failed_hosts = Vec::new();

            for result in results {
                let Some(task) = tasks_by_id.get_mut(&result.task_id) else {
                    warn!(task_id = %result.task_id, "检测结果对应的任务不存在");
                    continue;
                };
                let finished = task.record_result(result.is_success(), result.error.as_deref());
                if finished && task.status == DetectTaskStatus::Failed {
                    failed_hosts.push(task.host_id);
                }
                dirty.insert(result.task_id);
            }

            let updated: Vec<DetectTask> = dirty
                .iter()
                .filter_map(|id| tasks_by_id.get(id).cloned())
                .collect();
            if let Err(e) = self.repos.detect_tasks.save_progress(&updated).await {
                error!(suborder_id = suborder_id, "保存检测进度失败: {}", e);
                self.registry.cancel_suborder(suborder_id);
                return Err(e);
            }

            if !failed_hosts.is_empty() {
                if let Err(e) = self
                    .repos
                    .hosts
                    .update(
                        &HostFilter::by_suborder(suborder_id).with_host_ids(failed_hosts),
                        &HostUpdate::status(RecycleStatus::DetectFailed),
                    )
                    .await
                {
                    warn!(suborder_id = suborder_id, "更新检测失败主机状态失败: {}", e);
                }
            }

            self.write_order_counts(suborder_id, &DetectSummary::from_tasks(tasks_by_id.values()))
                .await;
        }

        let summary = DetectSummary::from_tasks(tasks_by_id.values());
        info!(
            suborder_id = suborder_id,
            rid = %rid,
            success = summary.success,
            failed = summary.failed,
            pending = summary.pending,
            "检测结束"
        );
        Ok(summary)
    }

    /// 计算每个步骤的处理方式，任何步骤处于运行中都会拒绝本次检测
    fn plan_steps(
        cfgs: &[DetectStepCfg],
        tasks: &[DetectTask],
        existing: &HashMap<String, DetectStep>,
    ) -> RecyclerResult<Vec<StepPlan>> {
        let mut plans = Vec::with_capacity(cfgs.len() * tasks.len());
        for cfg in cfgs {
            for task in tasks {
                let id = DetectStep::compose_id(&task.task_id, cfg.sequence);
                let plan = match existing.get(&id) {
                    None => StepPlan::Create(DetectStep::new(task, cfg.name, cfg.sequence)),
                    Some(step) => match step.status {
                        DetectStepStatus::Running => {
                            return Err(RecyclerError::StepAlreadyRunning { step_id: id });
                        }
                        DetectStepStatus::Success if !cfg.rerun_on_success() => {
                            StepPlan::Skip(step.clone())
                        }
                        _ => {
                            let mut step = step.clone();
                            step.status = DetectStepStatus::Init;
                            step.retry_time = 0;
                            step.message.clear();
                            step.log.clear();
                            step.end_at = None;
                            StepPlan::Reset(step)
                        }
                    },
                };
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    async fn persist_plan(
        &self,
        suborder_id: &str,
        tasks: &[DetectTask],
        plans: &[StepPlan],
    ) -> RecyclerResult<()> {
        self.repos.detect_tasks.save_progress(tasks).await?;

        let new_steps: Vec<DetectStep> = plans
            .iter()
            .filter_map(|plan| match plan {
                StepPlan::Create(step) => Some(step.clone()),
                _ => None,
            })
            .collect();
        if !new_steps.is_empty() {
            self.repos.detect_steps.create_many(&new_steps).await?;
        }

        let reset_ids: Vec<String> = plans
            .iter()
            .filter_map(|plan| match plan {
                StepPlan::Reset(step) => Some(step.id.clone()),
                _ => None,
            })
            .collect();
        if !reset_ids.is_empty() {
            let update = StepUpdate {
                status: Some(DetectStepStatus::Init),
                retry_time: Some(0),
                message: Some(String::new()),
                log: Some(String::new()),
                end_at: Some(None),
                ..Default::default()
            };
            self.repos
                .detect_steps
                .update(&StepFilter::by_ids(reset_ids), &update)
                .await?;
        }

        debug!(
            suborder_id = suborder_id,
            created = new_steps.len(),
            "检测步骤已准备"
        );
        Ok(())
    }

    fn build_batches(
        cfgs: &[DetectStepCfg],
        plans: Vec<StepPlan>,
        tasks: &HashMap<String, DetectTask>,
    ) -> Vec<StepBatch> {
        let mut batches: Vec<StepBatch> = cfgs.iter().map(|cfg| StepBatch::new(cfg.name)).collect();
        let index: HashMap<_, usize> = cfgs
            .iter()
            .enumerate()
            .map(|(i, cfg)| (cfg.name, i))
            .collect();

        for plan in plans {
            let (step, skip) = match plan {
                StepPlan::Create(step) | StepPlan::Reset(step) => (step, false),
                StepPlan::Skip(step) => (step, true),
            };
            let Some(&slot) = index.get(&step.step_name) else {
                continue;
            };
            let (ip, asset_id) = tasks
                .get(&step.task_id)
                .map(|t| (t.ip.as_str(), t.asset_id.as_str()))
                .unwrap_or_default();
            let meta = StepMeta::new(step, ip, asset_id);
            if skip {
                batches[slot].skipped.push(meta);
            } else {
                batches[slot].to_run.push(meta);
            }
        }
        batches
    }

    /// 回收单计数是次要写入，失败只记录日志
    async fn write_order_counts(&self, suborder_id: &str, summary: &DetectSummary) {
        let update = OrderUpdate {
            total_num: Some(summary.total),
            success_num: Some(summary.success),
            failed_num: Some(summary.failed),
            pending_num: Some(summary.pending),
            ..Default::default()
        };
        if let Err(e) = self
            .repos
            .orders
            .update(&OrderFilter::by_suborder(suborder_id), &update)
            .await
        {
            warn!(suborder_id = suborder_id, "更新回收单计数失败: {}", e);
        }
    }

    /// 检查检测结果，存在未成功的任务时返回错误，并写回失败数量
    pub async fn check_detect_status(&self, suborder_id: &str) -> RecyclerResult<()> {
        let tasks = self
            .repos
            .detect_tasks
            .find(&DetectTaskFilter::by_suborder(suborder_id))
            .await?;
        let summary = DetectSummary::from_tasks(tasks.iter());
        let not_passed = summary.total - summary.success;
        if not_passed == 0 {
            return Ok(());
        }

        let update = OrderUpdate {
            total_num: Some(summary.total),
            success_num: Some(summary.success),
            failed_num: Some(not_passed),
            pending_num: Some(0),
            ..Default::default()
        };
        self.repos
            .orders
            .update(&OrderFilter::by_suborder(suborder_id), &update)
            .await?;
        Err(RecyclerError::DetectNotPassed {
            suborder_id: suborder_id.to_string(),
            failed: not_passed,
        })
    }

    /// 丢弃子单所有进行中的检测
    pub fn cancel(&self, suborder_id: &str) {
        self.registry.cancel_suborder(suborder_id);
    }

    /// 暂停检测：取消执行中的步骤，任务标记为暂停，步骤回到初始状态
    pub async fn pause(&self, suborder_id: &str) -> RecyclerResult<()> {
        self.cancel(suborder_id);
        self.reset_running_steps(suborder_id).await?;

        let mut tasks = self
            .repos
            .detect_tasks
            .find(
                &DetectTaskFilter::by_suborder(suborder_id)
                    .with_statuses(&[DetectTaskStatus::Init, DetectTaskStatus::Running]),
            )
            .await?;
        for task in tasks.iter_mut() {
            task.status = DetectTaskStatus::Paused;
        }
        self.repos.detect_tasks.save_progress(&tasks).await?;
        info!(suborder_id = suborder_id, paused = tasks.len(), "检测已暂停");
        Ok(())
    }

    /// 进程重启后继续检测：上次遗留的运行中步骤先回到初始状态
    pub async fn resume(&self, order: &RecycleOrder) -> RecyclerResult<DetectSummary> {
        let reset = self.reset_running_steps(&order.suborder_id).await?;
        if reset > 0 {
            info!(suborder_id = %order.suborder_id, reset = reset, "已重置中断的检测步骤");
        }
        self.detect(order).await
    }

    async fn reset_running_steps(&self, suborder_id: &str) -> RecyclerResult<u64> {
        self.repos
            .detect_steps
            .update(
                &StepFilter::by_suborder(suborder_id).with_statuses(&[DetectStepStatus::Running]),
                &StepUpdate::status(DetectStepStatus::Init),
            )
            .await
    }

    /// 删除检测失败的主机及其检测记录，返回删除的主机数量
    pub async fn remove_failed_hosts(&self, suborder_id: &str) -> RecyclerResult<u64> {
        let failed_tasks = self
            .repos
            .detect_tasks
            .find(
                &DetectTaskFilter::by_suborder(suborder_id)
                    .with_statuses(&[DetectTaskStatus::Failed]),
            )
            .await?;
        if failed_tasks.is_empty() {
            return Ok(0);
        }

        let task_ids: Vec<String> = failed_tasks.iter().map(|t| t.task_id.clone()).collect();
        let host_ids: Vec<i64> = failed_tasks.iter().map(|t| t.host_id).collect();

        self.repos
            .detect_steps
            .delete(&StepFilter {
                suborder_id: Some(suborder_id.to_string()),
                task_ids: Some(task_ids.clone()),
                ..Default::default()
            })
            .await?;
        self.repos
            .detect_tasks
            .delete(&DetectTaskFilter {
                suborder_id: Some(suborder_id.to_string()),
                task_ids: Some(task_ids),
                ..Default::default()
            })
            .await?;
        let removed = self
            .repos
            .hosts
            .delete(&HostFilter::by_suborder(suborder_id).with_host_ids(host_ids))
            .await?;

        let remaining = self
            .repos
            .hosts
            .count(&HostFilter::by_suborder(suborder_id))
            .await?;
        self.repos
            .orders
            .update(
                &OrderFilter::by_suborder(suborder_id),
                &OrderUpdate {
                    total_num: Some(remaining),
                    success_num: Some(0),
                    failed_num: Some(0),
                    pending_num: Some(remaining),
                    ..Default::default()
                },
            )
            .await?;

        info!(suborder_id = suborder_id, removed = removed, remaining = remaining, "已移除检测失败的主机");
        Ok(removed)
    }
}
