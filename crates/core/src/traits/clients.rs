//! 外部系统接口
//!
//! 各检测项（故障单、安全基线、安全组、空闲进程、IP回收、云实例存量等）统一
//! 通过 `StepChecker` 暴露为 `(执行日志, 是否可重试, 错误)` 三元组，执行层对它们
//! 一视同仁。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{RecycleHost, RecycleOrder, StepName};
use crate::RecyclerResult;

/// 一次检测的目标主机
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckTarget {
    pub suborder_id: String,
    pub task_id: String,
    pub step_id: String,
    pub step_name: StepName,
    pub host_id: i64,
    pub ip: String,
    pub asset_id: String,
}

/// 一次检测的结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckReport {
    pub log: String,
    /// 失败是否为瞬时错误（超时、5xx），可由执行器重试
    pub retryable: bool,
    pub error: Option<String>,
}

impl CheckReport {
    pub fn success(log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            retryable: false,
            error: None,
        }
    }

    /// 策略性失败，例如主机有未完结的故障单
    pub fn rejected(error: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            retryable: false,
            error: Some(error.into()),
        }
    }

    /// 瞬时失败
    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            log: String::new(),
            retryable: true,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 单一检测项的检查接口
#[async_trait]
pub trait StepChecker: Send + Sync {
    /// 单批次允许的最大主机数，步骤配置的 batch_size 不能超过它
    fn max_batch_size(&self) -> usize;

    async fn check(&self, target: &CheckTarget) -> CheckReport;
}

/// 主机拓扑
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostTopo {
    pub host_id: i64,
    pub bk_biz_id: i64,
    pub bk_module_id: i64,
}

/// 模块元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleInfo {
    pub bk_biz_id: i64,
    pub bk_module_id: i64,
    pub name: String,
    /// 是否为“待回收”模块
    pub is_recycle: bool,
}

/// CMDB客户端
#[async_trait]
pub trait CmdbClient: Send + Sync {
    async fn get_host_topo(&self, host_ids: &[i64]) -> RecyclerResult<Vec<HostTopo>>;

    async fn get_module(&self, bk_biz_id: i64, bk_module_id: i64)
        -> RecyclerResult<Option<ModuleInfo>>;

    async fn transfer_hosts(
        &self,
        host_ids: &[i64],
        from_biz_id: i64,
        to_biz_id: i64,
        to_module_id: i64,
    ) -> RecyclerResult<()>;
}

/// 外部退回单引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReturnOrderRef {
    pub task_id: String,
    pub link: String,
}

/// 外部退回单状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReturnState {
    Running,
    Success,
    Failed(String),
}

/// 资源退回平台
#[async_trait]
pub trait ReturnProvider: Send + Sync {
    async fn create_return_order(
        &self,
        order: &RecycleOrder,
        hosts: &[RecycleHost],
    ) -> RecyclerResult<ReturnOrderRef>;

    async fn query_return_status(&self, task_id: &str) -> RecyclerResult<ReturnState>;

    /// 登记延迟退回计划，重复登记同一子单必须是无副作用的
    async fn schedule_return_plan(
        &self,
        order: &RecycleOrder,
        hosts: &[RecycleHost],
    ) -> RecyclerResult<()>;
}

/// 选主接口，只有主节点执行恢复
#[async_trait]
pub trait LeaderElector: Send + Sync {
    async fn is_master(&self) -> bool;
}
