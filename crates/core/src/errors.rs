use thiserror::Error;

use crate::models::{RecycleStatus, StepName};

/// 回收系统错误类型定义
#[derive(Debug, Error)]
pub enum RecyclerError {
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("回收单未找到: {suborder_id}")]
    OrderNotFound { suborder_id: String },

    #[error("检测任务未找到: {task_id}")]
    DetectTaskNotFound { task_id: String },

    #[error("不支持的检测步骤: {0}")]
    UnsupportedStep(String),

    #[error("检测步骤 {step} 与执行器 {executor} 不匹配")]
    StepMismatch { step: StepName, executor: StepName },

    #[error("回收单 {suborder_id} 的步骤 {step} 已提交且尚未完成")]
    DuplicateSubmission { suborder_id: String, step: StepName },

    #[error("检测步骤 {step_id} 正在运行中，不能重复下发")]
    StepAlreadyRunning { step_id: String },

    #[error("非法的状态流转: {from} 不接受事件 {event}")]
    IllegalTransition { from: RecycleStatus, event: String },

    #[error("回收单 {suborder_id} 检测未通过，失败 {failed} 台")]
    DetectNotPassed { suborder_id: String, failed: u64 },

    #[error("外部接口调用失败: {0}")]
    ExternalApi(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl RecyclerError {
    /// 是否为调用方参数或配置引起的错误，这类错误重试无意义
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecyclerError::UnsupportedStep(_)
                | RecyclerError::StepMismatch { .. }
                | RecyclerError::DuplicateSubmission { .. }
                | RecyclerError::Configuration(_)
                | RecyclerError::IllegalTransition { .. }
        )
    }
}

impl From<serde_json::Error> for RecyclerError {
    fn from(err: serde_json::Error) -> Self {
        RecyclerError::Serialization(err.to_string())
    }
}

impl From<::config::ConfigError> for RecyclerError {
    fn from(err: ::config::ConfigError) -> Self {
        RecyclerError::Configuration(err.to_string())
    }
}

/// 统一的Result类型
pub type RecyclerResult<T> = std::result::Result<T, RecyclerError>;
