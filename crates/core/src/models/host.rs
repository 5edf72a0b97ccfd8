use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecycleOrder, RecycleStage, RecycleStatus, RecycleType, ResourceType, ReturnPlan};

/// 回收主机
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecycleHost {
    pub suborder_id: String,
    pub host_id: i64,
    pub ip: String,
    pub asset_id: String,
    pub device_type: String,
    pub resource_type: ResourceType,
    pub recycle_type: RecycleType,
    pub return_plan: ReturnPlan,
    pub pool: String,
    pub stage: RecycleStage,
    pub status: RecycleStatus,
    pub return_id: String,
    pub return_link: String,
    pub return_tag: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl RecycleHost {
    /// 以回收单的分类信息创建主机记录
    pub fn for_order(order: &RecycleOrder, host_id: i64, ip: &str, asset_id: &str) -> Self {
        let now = Utc::now();
        Self {
            suborder_id: order.suborder_id.clone(),
            host_id,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
            device_type: String::new(),
            resource_type: order.resource_type,
            recycle_type: order.recycle_type,
            return_plan: order.return_plan,
            pool: String::new(),
            stage: order.stage,
            status: order.status,
            return_id: String::new(),
            return_link: String::new(),
            return_tag: String::new(),
            create_at: now,
            update_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub suborder_id: Option<String>,
    pub host_ids: Option<Vec<i64>>,
    pub statuses: Option<Vec<RecycleStatus>>,
    pub limit: Option<usize>,
}

impl HostFilter {
    pub fn by_suborder(suborder_id: &str) -> Self {
        Self {
            suborder_id: Some(suborder_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[RecycleStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn with_host_ids(mut self, host_ids: Vec<i64>) -> Self {
        self.host_ids = Some(host_ids);
        self
    }

    pub fn matches(&self, host: &RecycleHost) -> bool {
        if let Some(id) = &self.suborder_id {
            if &host.suborder_id != id {
                return false;
            }
        }
        if let Some(ids) = &self.host_ids {
            if !ids.contains(&host.host_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&host.status) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostUpdate {
    pub status: Option<RecycleStatus>,
    pub return_id: Option<String>,
    pub return_link: Option<String>,
    pub return_tag: Option<String>,
}

impl HostUpdate {
    pub fn status(status: RecycleStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, host: &mut RecycleHost) {
        if let Some(status) = self.status {
            host.status = status;
            host.stage = status.stage();
        }
        if let Some(v) = &self.return_id {
            host.return_id = v.clone();
        }
        if let Some(v) = &self.return_link {
            host.return_link = v.clone();
        }
        if let Some(v) = &self.return_tag {
            host.return_tag = v.clone();
        }
        host.update_at = Utc::now();
    }
}
