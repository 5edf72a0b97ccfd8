use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RecyclerError;

/// 检测步骤类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepName {
    /// 预检查，任何情况下都不会被跳过
    PreCheck,
    /// 检查是否有未完结的故障单
    CheckUwork,
    /// 安全基线检查
    CheckSafety,
    /// 安全组绑定检查
    CheckSecurityGroup,
    /// 空闲进程校验
    CheckProcess,
    /// 运维负责人校验
    CheckOwner,
    /// IP回收检查
    CheckIpReclaim,
    /// 云实例存量检查
    CheckCvmInstance,
    BasicCheck,
}

impl StepName {
    pub const ALL: [StepName; 9] = [
        StepName::PreCheck,
        StepName::CheckUwork,
        StepName::CheckSafety,
        StepName::CheckSecurityGroup,
        StepName::CheckProcess,
        StepName::CheckOwner,
        StepName::CheckIpReclaim,
        StepName::CheckCvmInstance,
        StepName::BasicCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::PreCheck => "PreCheck",
            StepName::CheckUwork => "CheckUwork",
            StepName::CheckSafety => "CheckSafety",
            StepName::CheckSecurityGroup => "CheckSecurityGroup",
            StepName::CheckProcess => "CheckProcess",
            StepName::CheckOwner => "CheckOwner",
            StepName::CheckIpReclaim => "CheckIpReclaim",
            StepName::CheckCvmInstance => "CheckCvmInstance",
            StepName::BasicCheck => "BasicCheck",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = RecyclerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| RecyclerError::UnsupportedStep(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectTaskStatus {
    Init,
    Running,
    Paused,
    Success,
    Failed,
}

/// 单台主机在检测阶段的任务，汇总该主机所有检测步骤的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectTask {
    pub task_id: String,
    pub suborder_id: String,
    pub host_id: i64,
    pub ip: String,
    pub asset_id: String,
    pub status: DetectTaskStatus,
    pub message: String,
    pub total_num: u64,
    pub success_num: u64,
    pub failed_num: u64,
    pub pending_num: u64,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl DetectTask {
    pub fn new(task_id: String, suborder_id: &str, host_id: i64, ip: &str, asset_id: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            suborder_id: suborder_id.to_string(),
            host_id,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
            status: DetectTaskStatus::Init,
            message: String::new(),
            total_num: 0,
            success_num: 0,
            failed_num: 0,
            pending_num: 0,
            create_at: now,
            update_at: now,
        }
    }

    /// 重新开始一轮检测
    pub fn reset_for_run(&mut self, step_count: u64) {
        self.status = DetectTaskStatus::Running;
        self.message.clear();
        self.total_num = step_count;
        self.pending_num = step_count;
        self.success_num = 0;
        self.failed_num = 0;
        self.update_at = Utc::now();
    }

    /// 记录一个步骤的结果，返回该任务是否已全部完成
    ///
    /// 失败是粘性的：一旦有步骤失败，后续成功结果不会把任务改回成功。
    pub fn record_result(&mut self, success: bool, message: Option<&str>) -> bool {
        if success {
            self.success_num += 1;
        } else {
            self.failed_num += 1;
            self.status = DetectTaskStatus::Failed;
            if let Some(msg) = message {
                if self.message.is_empty() {
                    self.message = msg.to_string();
                } else {
                    self.message = format!("{}; {}", self.message, msg);
                }
            }
        }
        self.pending_num = self.pending_num.saturating_sub(1);
        if self.pending_num == 0 && self.status != DetectTaskStatus::Failed {
            self.status = DetectTaskStatus::Success;
        }
        self.update_at = Utc::now();
        self.pending_num == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectTaskFilter {
    pub suborder_id: Option<String>,
    pub task_ids: Option<Vec<String>>,
    pub host_ids: Option<Vec<i64>>,
    pub statuses: Option<Vec<DetectTaskStatus>>,
}

impl DetectTaskFilter {
    pub fn by_suborder(suborder_id: &str) -> Self {
        Self {
            suborder_id: Some(suborder_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[DetectTaskStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, task: &DetectTask) -> bool {
        if let Some(id) = &self.suborder_id {
            if &task.suborder_id != id {
                return false;
            }
        }
        if let Some(ids) = &self.task_ids {
            if !ids.contains(&task.task_id) {
                return false;
            }
        }
        if let Some(ids) = &self.host_ids {
            if !ids.contains(&task.host_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectStepStatus {
    Init,
    Running,
    Success,
    Failed,
}

/// 单个主机的单个检测步骤
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectStep {
    /// 形如 `{task_id}-{sequence}`
    pub id: String,
    pub task_id: String,
    pub suborder_id: String,
    pub host_id: i64,
    pub step_name: StepName,
    pub sequence: u32,
    pub status: DetectStepStatus,
    pub retry_time: u32,
    pub message: String,
    pub log: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl DetectStep {
    pub fn new(task: &DetectTask, step_name: StepName, sequence: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Self::compose_id(&task.task_id, sequence),
            task_id: task.task_id.clone(),
            suborder_id: task.suborder_id.clone(),
            host_id: task.host_id,
            step_name,
            sequence,
            status: DetectStepStatus::Init,
            retry_time: 0,
            message: String::new(),
            log: String::new(),
            start_at: None,
            end_at: None,
            create_at: now,
            update_at: now,
        }
    }

    pub fn compose_id(task_id: &str, sequence: u32) -> String {
        format!("{task_id}-{sequence}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    pub suborder_id: Option<String>,
    pub ids: Option<Vec<String>>,
    pub task_ids: Option<Vec<String>>,
    pub step_name: Option<StepName>,
    pub statuses: Option<Vec<DetectStepStatus>>,
}

impl StepFilter {
    pub fn by_suborder(suborder_id: &str) -> Self {
        Self {
            suborder_id: Some(suborder_id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step_name: StepName) -> Self {
        self.step_name = Some(step_name);
        self
    }

    pub fn with_statuses(mut self, statuses: &[DetectStepStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, step: &DetectStep) -> bool {
        if let Some(id) = &self.suborder_id {
            if &step.suborder_id != id {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&step.id) {
                return false;
            }
        }
        if let Some(ids) = &self.task_ids {
            if !ids.contains(&step.task_id) {
                return false;
            }
        }
        if let Some(name) = self.step_name {
            if step.step_name != name {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&step.status) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<DetectStepStatus>,
    pub retry_time: Option<u32>,
    pub message: Option<String>,
    pub log: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<Option<DateTime<Utc>>>,
}

impl StepUpdate {
    pub fn status(status: DetectStepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, step: &mut DetectStep) {
        if let Some(status) = self.status {
            step.status = status;
        }
        if let Some(v) = self.retry_time {
            step.retry_time = v;
        }
        if let Some(v) = &self.message {
            step.message = v.clone();
        }
        if let Some(v) = &self.log {
            step.log = v.clone();
        }
        if let Some(v) = self.start_at {
            step.start_at = Some(v);
        }
        if let Some(v) = self.end_at {
            step.end_at = v;
        }
        step.update_at = Utc::now();
    }
}

/// 检测步骤配置，决定执行器的构造参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectStepCfg {
    pub name: StepName,
    #[serde(default)]
    pub description: String,
    /// 执行顺序，同时决定步骤ID后缀
    pub sequence: u32,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// 最大重试次数
    #[serde(default)]
    pub retry: u32,
    /// 已成功的步骤在重新检测时是否仍要执行
    #[serde(default)]
    pub retry_on_success: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,
    #[serde(default = "default_qps")]
    pub rate_limit_qps: f64,
    #[serde(default = "default_burst")]
    pub rate_limit_burst: u32,
    #[serde(default)]
    pub retry_interval_sec: u64,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_worker_num() -> usize {
    5
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    10
}

impl DetectStepCfg {
    pub fn new(name: StepName, sequence: u32) -> Self {
        Self {
            name,
            description: String::new(),
            sequence,
            enable: true,
            retry: 0,
            retry_on_success: false,
            batch_size: default_batch_size(),
            worker_num: default_worker_num(),
            rate_limit_qps: default_qps(),
            rate_limit_burst: default_burst(),
            retry_interval_sec: 0,
        }
    }

    /// 已成功的步骤是否需要重新执行
    pub fn rerun_on_success(&self) -> bool {
        self.name == StepName::PreCheck || self.retry_on_success
    }
}
