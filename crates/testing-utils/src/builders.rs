//! 测试数据构造器

use chrono::{DateTime, Utc};
use recycler_core::models::{
    DetectStepCfg, RecycleHost, RecycleOrder, RecycleStatus, RecycleType, ResourceType,
    ReturnPlan, StepName,
};

pub struct OrderBuilder {
    order: RecycleOrder,
}

impl OrderBuilder {
    pub fn new(suborder_id: &str) -> Self {
        Self {
            order: RecycleOrder::new(
                suborder_id,
                1,
                100,
                ResourceType::Cvm,
                RecycleType::Regular,
                ReturnPlan::Immediate,
            ),
        }
    }

    pub fn with_status(mut self, status: RecycleStatus) -> Self {
        self.order.status = status;
        self.order.stage = status.stage();
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.order.resource_type = resource_type;
        self
    }

    pub fn with_recycle_type(mut self, recycle_type: RecycleType) -> Self {
        self.order.recycle_type = recycle_type;
        self
    }

    pub fn with_return_plan(mut self, return_plan: ReturnPlan) -> Self {
        self.order.return_plan = return_plan;
        self
    }

    pub fn with_skip_confirm(mut self, skip_confirm: bool) -> Self {
        self.order.skip_confirm = skip_confirm;
        self
    }

    pub fn with_biz(mut self, bk_biz_id: i64) -> Self {
        self.order.bk_biz_id = bk_biz_id;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.order.create_at = at;
        self.order.update_at = at;
        self
    }

    pub fn build(self) -> RecycleOrder {
        self.order
    }
}

pub struct HostBuilder {
    host: RecycleHost,
}

impl HostBuilder {
    /// 以回收单当前的分类与状态创建主机
    pub fn for_order(order: &RecycleOrder, host_id: i64) -> Self {
        let ip = format!("10.0.{}.{}", (host_id / 256) % 256, host_id % 256);
        let asset_id = format!("TC{host_id:08}");
        Self {
            host: RecycleHost::for_order(order, host_id, &ip, &asset_id),
        }
    }

    pub fn with_status(mut self, status: RecycleStatus) -> Self {
        self.host.status = status;
        self.host.stage = status.stage();
        self
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.host.ip = ip.to_string();
        self
    }

    pub fn with_asset_id(mut self, asset_id: &str) -> Self {
        self.host.asset_id = asset_id.to_string();
        self
    }

    pub fn build(self) -> RecycleHost {
        self.host
    }
}

pub struct StepCfgBuilder {
    cfg: DetectStepCfg,
}

impl StepCfgBuilder {
    pub fn new(name: StepName, sequence: u32) -> Self {
        let mut cfg = DetectStepCfg::new(name, sequence);
        cfg.rate_limit_qps = 1000.0;
        cfg.rate_limit_burst = 100;
        Self { cfg }
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.cfg.retry = retry;
        self
    }

    pub fn with_retry_on_success(mut self, retry_on_success: bool) -> Self {
        self.cfg.retry_on_success = retry_on_success;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.cfg.batch_size = batch_size;
        self
    }

    pub fn with_worker_num(mut self, worker_num: usize) -> Self {
        self.cfg.worker_num = worker_num;
        self
    }

    pub fn with_retry_interval(mut self, seconds: u64) -> Self {
        self.cfg.retry_interval_sec = seconds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.cfg.enable = false;
        self
    }

    pub fn build(self) -> DetectStepCfg {
        self.cfg
    }
}
