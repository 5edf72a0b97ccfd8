//! 结构化日志事件
//!
//! 统一关键业务事件的字段命名，便于日志平台检索。

use tracing::{error, info, warn};

use recycler_core::models::{RecycleStatus, StepName};

pub struct StructuredLogger;

impl StructuredLogger {
    /// 回收单状态流转
    pub fn log_order_transition(
        suborder_id: &str,
        from: RecycleStatus,
        event: &str,
        to: RecycleStatus,
    ) {
        info!(
            event = "order_transition",
            suborder.id = suborder_id,
            order.from = %from,
            order.event = event,
            order.to = %to,
            "回收单状态流转"
        );
    }

    /// 检测步骤最终结果
    pub fn log_step_finished(
        suborder_id: &str,
        step_id: &str,
        step: StepName,
        attempts: u32,
        error: Option<&str>,
    ) {
        match error {
            None => info!(
                event = "step_finished",
                suborder.id = suborder_id,
                step.id = step_id,
                step.name = %step,
                step.attempts = attempts,
                "检测步骤通过"
            ),
            Some(err) => warn!(
                event = "step_finished",
                suborder.id = suborder_id,
                step.id = step_id,
                step.name = %step,
                step.attempts = attempts,
                step.error = err,
                "检测步骤未通过"
            ),
        }
    }

    /// 检测步骤进入重试
    pub fn log_step_retry(suborder_id: &str, step_id: &str, step: StepName, retry_times: u32) {
        info!(
            event = "step_retry",
            suborder.id = suborder_id,
            step.id = step_id,
            step.name = %step,
            step.retry_times = retry_times,
            "检测步骤准备重试"
        );
    }

    /// 恢复处理结果
    pub fn log_order_recovered(suborder_id: &str, status: RecycleStatus, action: &str) {
        info!(
            event = "order_recovered",
            suborder.id = suborder_id,
            order.status = %status,
            recovery.action = action,
            "回收单恢复处理完成"
        );
    }

    pub fn log_system_error(component: &str, operation: &str, err: &dyn std::error::Error) {
        error!(
            event = "system_error",
            component = component,
            operation = operation,
            error = %err,
            "系统错误"
        );
    }
}
