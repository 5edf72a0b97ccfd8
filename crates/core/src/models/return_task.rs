use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnTaskStatus {
    Init,
    Running,
    Paused,
    Success,
    Failed,
}

/// 退回任务，与回收单一一对应，首次进入退回阶段时创建
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReturnTask {
    pub suborder_id: String,
    pub resource_type: ResourceType,
    /// 外部退回单号，创建成功前为空
    pub task_id: String,
    pub task_link: String,
    pub status: ReturnTaskStatus,
    pub message: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl ReturnTask {
    pub fn new(suborder_id: &str, resource_type: ResourceType) -> Self {
        let now = Utc::now();
        Self {
            suborder_id: suborder_id.to_string(),
            resource_type,
            task_id: String::new(),
            task_link: String::new(),
            status: ReturnTaskStatus::Init,
            message: String::new(),
            create_at: now,
            update_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReturnTaskUpdate {
    pub status: Option<ReturnTaskStatus>,
    pub task_id: Option<String>,
    pub task_link: Option<String>,
    pub message: Option<String>,
}

impl ReturnTaskUpdate {
    pub fn apply(&self, task: &mut ReturnTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(v) = &self.task_id {
            task.task_id = v.clone();
        }
        if let Some(v) = &self.task_link {
            task.task_link = v.clone();
        }
        if let Some(v) = &self.message {
            task.message = v.clone();
        }
        task.update_at = Utc::now();
    }
}
