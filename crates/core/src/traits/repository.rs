//! 数据仓储层接口定义
//!
//! 每个实体一个仓储接口，职责单一：
//! - `OrderRepository` - 回收单
//! - `HostRepository` - 回收主机
//! - `DetectTaskRepository` - 检测任务
//! - `DetectStepRepository` - 检测步骤
//! - `StepCfgRepository` - 检测步骤配置
//! - `ReturnTaskRepository` - 退回任务
//!
//! 更新操作都以过滤条件限定范围并返回受影响的行数。状态流转时把当前状态
//! 放进过滤条件，即可保证并发写入下的幂等与单调。

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{
    DetectStep, DetectStepCfg, DetectTask, DetectTaskFilter, HostFilter, HostUpdate,
    OrderFilter, OrderUpdate, RecycleHost, RecycleOrder, ReturnTask, ReturnTaskUpdate,
    StepFilter, StepUpdate,
};
use crate::RecyclerResult;

/// 回收单仓储接口
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// 新建回收单，子单号已存在时报错
    async fn create(&self, order: &RecycleOrder) -> RecyclerResult<()>;

    async fn get(&self, suborder_id: &str) -> RecyclerResult<Option<RecycleOrder>>;

    /// 按创建时间升序返回
    async fn find(&self, filter: &OrderFilter) -> RecyclerResult<Vec<RecycleOrder>>;

    async fn count(&self, filter: &OrderFilter) -> RecyclerResult<u64>;

    async fn update(&self, filter: &OrderFilter, update: &OrderUpdate) -> RecyclerResult<u64>;
}

/// 回收主机仓储接口
#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn create_many(&self, hosts: &[RecycleHost]) -> RecyclerResult<()>;

    async fn find(&self, filter: &HostFilter) -> RecyclerResult<Vec<RecycleHost>>;

    async fn count(&self, filter: &HostFilter) -> RecyclerResult<u64>;

    async fn update(&self, filter: &HostFilter, update: &HostUpdate) -> RecyclerResult<u64>;

    async fn delete(&self, filter: &HostFilter) -> RecyclerResult<u64>;
}

/// 检测任务仓储接口
#[async_trait]
pub trait DetectTaskRepository: Send + Sync {
    async fn create_many(&self, tasks: &[DetectTask]) -> RecyclerResult<()>;

    async fn find(&self, filter: &DetectTaskFilter) -> RecyclerResult<Vec<DetectTask>>;

    async fn count(&self, filter: &DetectTaskFilter) -> RecyclerResult<u64>;

    /// 批量写回任务的状态、计数和信息
    async fn save_progress(&self, tasks: &[DetectTask]) -> RecyclerResult<()>;

    async fn delete(&self, filter: &DetectTaskFilter) -> RecyclerResult<u64>;

    /// 获取指定名称的自增序列的下一个值
    async fn next_sequence(&self, name: &str) -> RecyclerResult<u64>;
}

/// 检测步骤仓储接口
#[async_trait]
pub trait DetectStepRepository: Send + Sync {
    async fn create_many(&self, steps: &[DetectStep]) -> RecyclerResult<()>;

    async fn find(&self, filter: &StepFilter) -> RecyclerResult<Vec<DetectStep>>;

    async fn count(&self, filter: &StepFilter) -> RecyclerResult<u64>;

    async fn update(&self, filter: &StepFilter, update: &StepUpdate) -> RecyclerResult<u64>;

    async fn delete(&self, filter: &StepFilter) -> RecyclerResult<u64>;
}

/// 检测步骤配置仓储接口
#[async_trait]
pub trait StepCfgRepository: Send + Sync {
    /// 按 `sequence` 升序返回全部配置
    async fn list(&self) -> RecyclerResult<Vec<DetectStepCfg>>;

    async fn upsert(&self, cfg: &DetectStepCfg) -> RecyclerResult<()>;

    async fn find_enabled(&self) -> RecyclerResult<Vec<DetectStepCfg>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|cfg| cfg.enable)
            .collect())
    }
}

/// 退回任务仓储接口
#[async_trait]
pub trait ReturnTaskRepository: Send + Sync {
    /// 新建退回任务，同一子单已存在时报错
    async fn create(&self, task: &ReturnTask) -> RecyclerResult<()>;

    async fn get(&self, suborder_id: &str) -> RecyclerResult<Option<ReturnTask>>;

    async fn update(&self, suborder_id: &str, update: &ReturnTaskUpdate) -> RecyclerResult<u64>;
}

/// 所有仓储的集合，便于在各模块之间传递
#[derive(Clone)]
pub struct Repositories {
    pub orders: Arc<dyn OrderRepository>,
    pub hosts: Arc<dyn HostRepository>,
    pub detect_tasks: Arc<dyn DetectTaskRepository>,
    pub detect_steps: Arc<dyn DetectStepRepository>,
    pub step_cfgs: Arc<dyn StepCfgRepository>,
    pub return_tasks: Arc<dyn ReturnTaskRepository>,
}
