//! 内存文档存储
//!
//! 以 `tokio::sync::RwLock<HashMap>` 实现全部仓储接口，适用于嵌入式部署和测试。
//! 所有更新都按过滤条件限定范围，语义与文档数据库的 UpdateMany 一致。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use recycler_core::models::{
    DetectStep, DetectStepCfg, DetectTask, DetectTaskFilter, HostFilter, HostUpdate, OrderFilter,
    OrderUpdate, RecycleHost, RecycleOrder, ReturnTask, ReturnTaskUpdate, StepFilter, StepName,
    StepUpdate,
};
use recycler_core::{
    DetectStepRepository, DetectTaskRepository, HostRepository, OrderRepository, RecyclerError,
    RecyclerResult, Repositories, ReturnTaskRepository, StepCfgRepository,
};

/// 内存文档存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: RwLock<HashMap<String, RecycleOrder>>,
    /// 以 (suborder_id, host_id) 为键
    hosts: RwLock<HashMap<(String, i64), RecycleHost>>,
    detect_tasks: RwLock<HashMap<String, DetectTask>>,
    detect_steps: RwLock<HashMap<String, DetectStep>>,
    step_cfgs: RwLock<HashMap<StepName, DetectStepCfg>>,
    return_tasks: RwLock<HashMap<String, ReturnTask>>,
    sequences: RwLock<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以同一个存储实例构造全部仓储
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            orders: self.clone(),
            hosts: self.clone(),
            detect_tasks: self.clone(),
            detect_steps: self.clone(),
            step_cfgs: self.clone(),
            return_tasks: self.clone(),
        }
    }
}

pub(crate) fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let iter = items.into_iter().skip(offset.unwrap_or(0));
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create(&self, order: &RecycleOrder) -> RecyclerResult<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.suborder_id) {
            return Err(RecyclerError::DatabaseOperation(format!(
                "回收单 {} 已存在",
                order.suborder_id
            )));
        }
        orders.insert(order.suborder_id.clone(), order.clone());
        Ok(())
    }

    async fn get(&self, suborder_id: &str) -> RecyclerResult<Option<RecycleOrder>> {
        Ok(self.orders.read().await.get(suborder_id).cloned())
    }

    async fn find(&self, filter: &OrderFilter) -> RecyclerResult<Vec<RecycleOrder>> {
        let orders = self.orders.read().await;
        let mut found: Vec<RecycleOrder> =
            orders.values().filter(|o| filter.matches(o)).cloned().collect();
        found.sort_by(|a, b| {
            a.create_at
                .cmp(&b.create_at)
                .then_with(|| a.suborder_id.cmp(&b.suborder_id))
        });
        Ok(paginate(found, filter.offset, filter.limit))
    }

    async fn count(&self, filter: &OrderFilter) -> RecyclerResult<u64> {
        let orders = self.orders.read().await;
        Ok(orders.values().filter(|o| filter.matches(o)).count() as u64)
    }

    async fn update(&self, filter: &OrderFilter, update: &OrderUpdate) -> RecyclerResult<u64> {
        let mut orders = self.orders.write().await;
        let mut affected = 0;
        for order in orders.values_mut().filter(|o| filter.matches(o)) {
            update.apply(order);
            affected += 1;
        }
        debug!("更新回收单 {} 条", affected);
        Ok(affected)
    }
}

#[async_trait]
impl HostRepository for MemoryStore {
    async fn create_many(&self, hosts: &[RecycleHost]) -> RecyclerResult<()> {
        let mut table = self.hosts.write().await;
        for host in hosts {
            let key = (host.suborder_id.clone(), host.host_id);
            if table.contains_key(&key) {
                return Err(RecyclerError::DatabaseOperation(format!(
                    "回收单 {} 中主机 {} 已存在",
                    host.suborder_id, host.host_id
                )));
            }
        }
        for host in hosts {
            table.insert((host.suborder_id.clone(), host.host_id), host.clone());
        }
        Ok(())
    }

    async fn find(&self, filter: &HostFilter) -> RecyclerResult<Vec<RecycleHost>> {
        let table = self.hosts.read().await;
        let mut found: Vec<RecycleHost> =
            table.values().filter(|h| filter.matches(h)).cloned().collect();
        found.sort_by_key(|h| h.host_id);
        Ok(paginate(found, None, filter.limit))
    }

    async fn count(&self, filter: &HostFilter) -> RecyclerResult<u64> {
        let table = self.hosts.read().await;
        Ok(table.values().filter(|h| filter.matches(h)).count() as u64)
    }

    async fn update(&self, filter: &HostFilter, update: &HostUpdate) -> RecyclerResult<u64> {
        let mut table = self.hosts.write().await;
        let mut affected = 0;
        for host in table.values_mut().filter(|h| filter.matches(h)) {
            update.apply(host);
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, filter: &HostFilter) -> RecyclerResult<u64> {
        let mut table = self.hosts.write().await;
        let before = table.len();
        table.retain(|_, h| !filter.matches(h));
        Ok((before - table.len()) as u64)
    }
}

#[async_trait]
impl DetectTaskRepository for MemoryStore {
    async fn create_many(&self, tasks: &[DetectTask]) -> RecyclerResult<()> {
        let mut table = self.detect_tasks.write().await;
        if let Some(dup) = tasks.iter().find(|t| table.contains_key(&t.task_id)) {
            return Err(RecyclerError::DatabaseOperation(format!(
                "检测任务 {} 已存在",
                dup.task_id
            )));
        }
        for task in tasks {
            table.insert(task.task_id.clone(), task.clone());
        }
        Ok(())
    }

    async fn find(&self, filter: &DetectTaskFilter) -> RecyclerResult<Vec<DetectTask>> {
        let table = self.detect_tasks.read().await;
        let mut found: Vec<DetectTask> =
            table.values().filter(|t| filter.matches(t)).cloned().collect();
        found.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(found)
    }

    async fn count(&self, filter: &DetectTaskFilter) -> RecyclerResult<u64> {
        let table = self.detect_tasks.read().await;
        Ok(table.values().filter(|t| filter.matches(t)).count() as u64)
    }

    async fn save_progress(&self, tasks: &[DetectTask]) -> RecyclerResult<()> {
        let mut table = self.detect_tasks.write().await;
        for task in tasks {
            match table.get_mut(&task.task_id) {
                Some(existing) => {
                    existing.status = task.status;
                    existing.message = task.message.clone();
                    existing.total_num = task.total_num;
                    existing.success_num = task.success_num;
                    existing.failed_num = task.failed_num;
                    existing.pending_num = task.pending_num;
                    existing.update_at = task.update_at;
                }
                None => {
                    return Err(RecyclerError::DetectTaskNotFound {
                        task_id: task.task_id.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, filter: &DetectTaskFilter) -> RecyclerResult<u64> {
        let mut table = self.detect_tasks.write().await;
        let before = table.len();
        table.retain(|_, t| !filter.matches(t));
        Ok((before - table.len()) as u64)
    }

    async fn next_sequence(&self, name: &str) -> RecyclerResult<u64> {
        let mut sequences = self.sequences.write().await;
        let seq = sequences.entry(name.to_string()).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }
}

#[async_trait]
impl DetectStepRepository for MemoryStore {
    async fn create_many(&self, steps: &[DetectStep]) -> RecyclerResult<()> {
        let mut table = self.detect_steps.write().await;
        if let Some(dup) = steps.iter().find(|s| table.contains_key(&s.id)) {
            return Err(RecyclerError::DatabaseOperation(format!(
                "检测步骤 {} 已存在",
                dup.id
            )));
        }
        for step in steps {
            table.insert(step.id.clone(), step.clone());
        }
        Ok(())
    }

    async fn find(&self, filter: &StepFilter) -> RecyclerResult<Vec<DetectStep>> {
        let table = self.detect_steps.read().await;
        let mut found: Vec<DetectStep> =
            table.values().filter(|s| filter.matches(s)).cloned().collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn count(&self, filter: &StepFilter) -> RecyclerResult<u64> {
        let table = self.detect_steps.read().await;
        Ok(table.values().filter(|s| filter.matches(s)).count() as u64)
    }

    async fn update(&self, filter: &StepFilter, update: &StepUpdate) -> RecyclerResult<u64> {
        let mut table = self.detect_steps.write().await;
        let mut affected = 0;
        for step in table.values_mut().filter(|s| filter.matches(s)) {
            update.apply(step);
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, filter: &StepFilter) -> RecyclerResult<u64> {
        let mut table = self.detect_steps.write().await;
        let before = table.len();
        table.retain(|_, s| !filter.matches(s));
        Ok((before - table.len()) as u64)
    }
}

#[async_trait]
impl StepCfgRepository for MemoryStore {
    async fn list(&self) -> RecyclerResult<Vec<DetectStepCfg>> {
        let table = self.step_cfgs.read().await;
        let mut cfgs: Vec<DetectStepCfg> = table.values().cloned().collect();
        cfgs.sort_by_key(|c| c.sequence);
        Ok(cfgs)
    }

    async fn upsert(&self, cfg: &DetectStepCfg) -> RecyclerResult<()> {
        self.step_cfgs.write().await.insert(cfg.name, cfg.clone());
        Ok(())
    }
}

#[async_trait]
impl ReturnTaskRepository for MemoryStore {
    async fn create(&self, task: &ReturnTask) -> RecyclerResult<()> {
        let mut table = self.return_tasks.write().await;
        if table.contains_key(&task.suborder_id) {
            return Err(RecyclerError::DatabaseOperation(format!(
                "回收单 {} 的退回任务已存在",
                task.suborder_id
            )));
        }
        table.insert(task.suborder_id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, suborder_id: &str) -> RecyclerResult<Option<ReturnTask>> {
        Ok(self.return_tasks.read().await.get(suborder_id).cloned())
    }

    async fn update(&self, suborder_id: &str, update: &ReturnTaskUpdate) -> RecyclerResult<u64> {
        let mut table = self.return_tasks.write().await;
        match table.get_mut(suborder_id) {
            Some(task) => {
                update.apply(task);
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
