use crate::models::{RecycleStatus, StepName};

/// 检测步骤指标记录器，通过构造参数注入各组件
pub trait StepMetrics: Send + Sync {
    /// 记录一次检测调用的耗时
    fn record_step_latency(&self, step: StepName, seconds: f64);

    /// 记录一次检测失败
    fn record_step_error(&self, step: StepName);

    /// 记录一次重试调度
    fn record_step_retry(&self, _step: StepName) {}

    /// 更新步骤等待队列长度
    fn update_wait_list_depth(&self, _step: StepName, _depth: usize) {}
}

/// 回收单指标记录器，分发器与恢复服务共用
pub trait OrderMetrics: Send + Sync {
    /// 记录一次回收单状态流转
    fn record_order_transition(&self, from: RecycleStatus, to: RecycleStatus);

    /// 记录一次恢复处理
    fn record_recovered_order(&self, _status: RecycleStatus, _success: bool) {}
}

/// 不记录任何指标
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl StepMetrics for NoopMetrics {
    fn record_step_latency(&self, _step: StepName, _seconds: f64) {}

    fn record_step_error(&self, _step: StepName) {}
}

impl OrderMetrics for NoopMetrics {
    fn record_order_transition(&self, _from: RecycleStatus, _to: RecycleStatus) {}
}
