//! 回收系统指标采集
//!
//! 通过 `metrics` 门面记录，进程未安装导出器时所有记录都是空操作，
//! 因此测试中可以直接构造使用。

use metrics::{counter, gauge, histogram};
use tracing::debug;

use recycler_core::models::{RecycleStatus, StepName};
use recycler_core::{OrderMetrics, StepMetrics};

/// 指标采集器
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }
}

impl OrderMetrics for MetricsCollector {
    fn record_order_transition(&self, from: RecycleStatus, to: RecycleStatus) {
        counter!(
            "recycler_order_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn record_recovered_order(&self, status: RecycleStatus, success: bool) {
        let result = if success { "success" } else { "failed" };
        counter!(
            "recycler_recovered_orders_total",
            "status" => status.as_str(),
            "result" => result
        )
        .increment(1);
    }
}

impl StepMetrics for MetricsCollector {
    fn record_step_latency(&self, step: StepName, seconds: f64) {
        histogram!("recycler_detect_step_duration_seconds", "step" => step.as_str())
            .record(seconds);
        debug!(step = %step, duration_seconds = seconds, "检测步骤执行完成");
    }

    fn record_step_error(&self, step: StepName) {
        counter!("recycler_detect_step_errors_total", "step" => step.as_str()).increment(1);
    }

    fn record_step_retry(&self, step: StepName) {
        counter!("recycler_detect_step_retries_total", "step" => step.as_str()).increment(1);
    }

    fn update_wait_list_depth(&self, step: StepName, depth: usize) {
        gauge!("recycler_wait_list_depth", "step" => step.as_str()).set(depth as f64);
    }
}
