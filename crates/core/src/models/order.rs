use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 回收阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecycleStage {
    Commit,
    Detect,
    Audit,
    Transit,
    Return,
    Done,
    Terminate,
}

/// 回收单状态
///
/// 每个状态只属于一个阶段，阶段由状态推导，二者不会出现不一致。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecycleStatus {
    Uncommit,
    Committed,
    Detecting,
    DetectFailed,
    Audit,
    Rejected,
    Transiting,
    TransitFailed,
    Returning,
    ReturnFailed,
    ReturningPlan,
    Done,
    Terminate,
}

impl RecycleStatus {
    pub const ALL: [RecycleStatus; 13] = [
        RecycleStatus::Uncommit,
        RecycleStatus::Committed,
        RecycleStatus::Detecting,
        RecycleStatus::DetectFailed,
        RecycleStatus::Audit,
        RecycleStatus::Rejected,
        RecycleStatus::Transiting,
        RecycleStatus::TransitFailed,
        RecycleStatus::Returning,
        RecycleStatus::ReturnFailed,
        RecycleStatus::ReturningPlan,
        RecycleStatus::Done,
        RecycleStatus::Terminate,
    ];

    /// 状态所属阶段
    pub fn stage(self) -> RecycleStage {
        match self {
            RecycleStatus::Uncommit | RecycleStatus::Committed => RecycleStage::Commit,
            RecycleStatus::Detecting | RecycleStatus::DetectFailed => RecycleStage::Detect,
            RecycleStatus::Audit | RecycleStatus::Rejected => RecycleStage::Audit,
            RecycleStatus::Transiting | RecycleStatus::TransitFailed => RecycleStage::Transit,
            RecycleStatus::Returning
            | RecycleStatus::ReturnFailed
            | RecycleStatus::ReturningPlan => RecycleStage::Return,
            RecycleStatus::Done => RecycleStage::Done,
            RecycleStatus::Terminate => RecycleStage::Terminate,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecycleStatus::Done | RecycleStatus::Terminate)
    }

    /// 进程重启后需要恢复的中间状态
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            RecycleStatus::Committed
                | RecycleStatus::Detecting
                | RecycleStatus::Transiting
                | RecycleStatus::Returning
                | RecycleStatus::ReturningPlan
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecycleStatus::Uncommit => "UNCOMMIT",
            RecycleStatus::Committed => "COMMITTED",
            RecycleStatus::Detecting => "DETECTING",
            RecycleStatus::DetectFailed => "DETECT_FAILED",
            RecycleStatus::Audit => "AUDIT",
            RecycleStatus::Rejected => "REJECTED",
            RecycleStatus::Transiting => "TRANSITING",
            RecycleStatus::TransitFailed => "TRANSIT_FAILED",
            RecycleStatus::Returning => "RETURNING",
            RecycleStatus::ReturnFailed => "RETURN_FAILED",
            RecycleStatus::ReturningPlan => "RETURNING_PLAN",
            RecycleStatus::Done => "DONE",
            RecycleStatus::Terminate => "TERMINATE",
        }
    }
}

impl fmt::Display for RecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 资源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// 云服务器
    Cvm,
    /// IDC物理机
    IdcPm,
    Others,
}

/// 回收类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecycleType {
    Regular,
    /// 机房裁撤
    Dissolve,
    /// 过保
    Expired,
}

/// 退回计划
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnPlan {
    Immediate,
    Delay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecycleOrder {
    pub suborder_id: String,
    pub order_id: u64,
    pub bk_biz_id: i64,
    pub resource_type: ResourceType,
    pub recycle_type: RecycleType,
    pub return_plan: ReturnPlan,
    /// 检测通过后跳过人工审核
    pub skip_confirm: bool,
    pub stage: RecycleStage,
    pub status: RecycleStatus,
    pub total_num: u64,
    pub success_num: u64,
    pub pending_num: u64,
    pub failed_num: u64,
    pub message: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl RecycleOrder {
    pub fn new(
        suborder_id: impl Into<String>,
        order_id: u64,
        bk_biz_id: i64,
        resource_type: ResourceType,
        recycle_type: RecycleType,
        return_plan: ReturnPlan,
    ) -> Self {
        let now = Utc::now();
        Self {
            suborder_id: suborder_id.into(),
            order_id,
            bk_biz_id,
            resource_type,
            recycle_type,
            return_plan,
            skip_confirm: false,
            stage: RecycleStage::Commit,
            status: RecycleStatus::Uncommit,
            total_num: 0,
            success_num: 0,
            pending_num: 0,
            failed_num: 0,
            message: String::new(),
            create_at: now,
            update_at: now,
        }
    }

    /// 计数是否自洽（阶段完成后必须成立）
    pub fn counts_consistent(&self) -> bool {
        self.success_num + self.failed_num + self.pending_num == self.total_num
    }
}

/// 回收单过滤条件，未设置的字段不参与过滤
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub suborder_ids: Option<Vec<String>>,
    pub statuses: Option<Vec<RecycleStatus>>,
    pub bk_biz_id: Option<i64>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl OrderFilter {
    pub fn by_suborder(suborder_id: &str) -> Self {
        Self {
            suborder_ids: Some(vec![suborder_id.to_string()]),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[RecycleStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, order: &RecycleOrder) -> bool {
        if let Some(ids) = &self.suborder_ids {
            if !ids.contains(&order.suborder_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&order.status) {
                return false;
            }
        }
        if let Some(biz) = self.bk_biz_id {
            if order.bk_biz_id != biz {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if order.create_at < from {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if order.create_at >= before {
                return false;
            }
        }
        true
    }
}

/// 回收单更新内容，只写入设置了的字段
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub status: Option<RecycleStatus>,
    pub total_num: Option<u64>,
    pub success_num: Option<u64>,
    pub pending_num: Option<u64>,
    pub failed_num: Option<u64>,
    pub message: Option<String>,
}

impl OrderUpdate {
    pub fn status(status: RecycleStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn apply(&self, order: &mut RecycleOrder) {
        if let Some(status) = self.status {
            order.status = status;
            order.stage = status.stage();
        }
        if let Some(v) = self.total_num {
            order.total_num = v;
        }
        if let Some(v) = self.success_num {
            order.success_num = v;
        }
        if let Some(v) = self.pending_num {
            order.pending_num = v;
        }
        if let Some(v) = self.failed_num {
            order.failed_num = v;
        }
        if let Some(msg) = &self.message {
            order.message = msg.clone();
        }
        order.update_at = Utc::now();
    }
}
