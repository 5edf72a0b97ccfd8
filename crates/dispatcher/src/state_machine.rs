//! 回收单状态机
//!
//! 状态为封闭枚举，流转由一张 `(当前状态, 事件, 守卫) → (目标状态, 动作)` 的表
//! 定义。表在构造时校验：同一 `(状态, 事件, 守卫)` 不能重复；带守卫的行必须有
//! 一条不带守卫的兜底行。未定义的组合在运行时返回 `IllegalTransition`。

use std::collections::{HashMap, HashSet};
use std::fmt;

use recycler_core::models::{RecycleOrder, RecycleStatus, ReturnPlan};
use recycler_core::{RecyclerError, RecyclerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderEvent {
    Submit,
    CommitSuccess,
    CommitFailed,
    DetectSuccess,
    DetectFailed,
    AuditApprove,
    AuditReject,
    TransitSuccess,
    TransitFailed,
    ReturnSuccess,
    ReturnFailed,
    Pause,
    Resume,
    Revise,
    Terminate,
}

impl OrderEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderEvent::Submit => "Submit",
            OrderEvent::CommitSuccess => "CommitSuccess",
            OrderEvent::CommitFailed => "CommitFailed",
            OrderEvent::DetectSuccess => "DetectSuccess",
            OrderEvent::DetectFailed => "DetectFailed",
            OrderEvent::AuditApprove => "AuditApprove",
            OrderEvent::AuditReject => "AuditReject",
            OrderEvent::TransitSuccess => "TransitSuccess",
            OrderEvent::TransitFailed => "TransitFailed",
            OrderEvent::ReturnSuccess => "ReturnSuccess",
            OrderEvent::ReturnFailed => "ReturnFailed",
            OrderEvent::Pause => "Pause",
            OrderEvent::Resume => "Resume",
            OrderEvent::Revise => "Revise",
            OrderEvent::Terminate => "Terminate",
        }
    }
}

impl fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流转守卫，基于回收单属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Guard {
    /// 跳过人工审核，进入审核的动作据此追加审核通过事件
    SkipConfirm,
    /// 延迟退回
    DelayedReturn,
}

impl Guard {
    pub fn check(self, order: &RecycleOrder) -> bool {
        match self {
            Guard::SkipConfirm => order.skip_confirm,
            Guard::DelayedReturn => order.return_plan == ReturnPlan::Delay,
        }
    }
}

/// 进入目标状态后执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    None,
    /// 放入分发队列，由对应阶段处理
    Enqueue,
    /// 进入审核；跳过审核的单子直接追加审核通过事件
    EnterAudit,
    /// 暂停检测
    PauseDetect,
    /// 移除检测失败的主机后重新检测
    ReviseDetect,
    /// 丢弃所有进行中的检测
    CancelAll,
    /// 重置失败的退回任务后重新退回
    RetryReturn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RecycleStatus,
    pub event: OrderEvent,
    pub guard: Option<Guard>,
    pub to: RecycleStatus,
    pub action: Action,
}

#[derive(Debug)]
pub struct OrderStateMachine {
    table: HashMap<(RecycleStatus, OrderEvent), Vec<Transition>>,
}

const fn row(
    from: RecycleStatus,
    event: OrderEvent,
    guard: Option<Guard>,
    to: RecycleStatus,
    action: Action,
) -> Transition {
    Transition {
        from,
        event,
        guard,
        to,
        action,
    }
}

/// 回收流程的流转表
pub fn default_transitions() -> Vec<Transition> {
    use Action as A;
    use OrderEvent as E;
    use RecycleStatus as S;

    let mut rows = vec![
        row(S::Uncommit, E::Submit, None, S::Committed, A::Enqueue),
        row(S::Committed, E::CommitSuccess, None, S::Detecting, A::Enqueue),
        row(S::Committed, E::CommitFailed, None, S::Uncommit, A::None),
        row(S::Detecting, E::DetectSuccess, None, S::Audit, A::EnterAudit),
        row(S::Detecting, E::DetectFailed, None, S::DetectFailed, A::None),
        row(S::Detecting, E::Pause, None, S::DetectFailed, A::PauseDetect),
        row(S::DetectFailed, E::Resume, None, S::Detecting, A::Enqueue),
        row(S::DetectFailed, E::Revise, None, S::Detecting, A::ReviseDetect),
        row(S::Audit, E::AuditApprove, None, S::Transiting, A::Enqueue),
        row(S::Audit, E::AuditReject, None, S::Rejected, A::None),
        row(
            S::Transiting,
            E::TransitSuccess,
            Some(Guard::DelayedReturn),
            S::ReturningPlan,
            A::Enqueue,
        ),
        row(S::Transiting, E::TransitSuccess, None, S::Returning, A::Enqueue),
        row(S::Transiting, E::TransitFailed, None, S::TransitFailed, A::None),
        row(S::TransitFailed, E::Resume, None, S::Transiting, A::Enqueue),
        row(S::Returning, E::ReturnSuccess, None, S::Done, A::None),
        row(S::Returning, E::ReturnFailed, None, S::ReturnFailed, A::None),
        row(S::ReturningPlan, E::ReturnSuccess, None, S::Done, A::None),
        row(S::ReturningPlan, E::ReturnFailed, None, S::ReturnFailed, A::None),
        row(S::ReturnFailed, E::Resume, None, S::Returning, A::RetryReturn),
    ];

    for status in RecycleStatus::ALL {
        if !status.is_terminal() {
            rows.push(row(status, E::Terminate, None, S::Terminate, A::CancelAll));
        }
    }
    rows
}

impl OrderStateMachine {
    pub fn new() -> RecyclerResult<Self> {
        Self::with_transitions(default_transitions())
    }

    pub fn with_transitions(rows: Vec<Transition>) -> RecyclerResult<Self> {
        let mut seen = HashSet::new();
        let mut table: HashMap<(RecycleStatus, OrderEvent), Vec<Transition>> = HashMap::new();

        for transition in rows {
            if transition.from.is_terminal() {
                return Err(RecyclerError::Configuration(format!(
                    "终态 {} 不能再流转",
                    transition.from
                )));
            }
            if !seen.insert((transition.from, transition.event, transition.guard)) {
                return Err(RecyclerError::Configuration(format!(
                    "重复的流转定义: {} + {}",
                    transition.from, transition.event
                )));
            }
            table
                .entry((transition.from, transition.event))
                .or_default()
                .push(transition);
        }

        for ((from, event), rows) in table.iter_mut() {
            if !rows.iter().any(|t| t.guard.is_none()) {
                return Err(RecyclerError::Configuration(format!(
                    "流转 {from} + {event} 缺少无守卫的兜底定义"
                )));
            }
            // 带守卫的行优先匹配
            rows.sort_by_key(|t| t.guard.is_none());
        }

        Ok(Self { table })
    }

    /// 计算回收单在当前状态下收到事件后的流转
    pub fn resolve(&self, order: &RecycleOrder, event: OrderEvent) -> RecyclerResult<Transition> {
        self.table
            .get(&(order.status, event))
            .and_then(|rows| {
                rows.iter()
                    .find(|t| t.guard.map_or(true, |guard| guard.check(order)))
                    .copied()
            })
            .ok_or_else(|| RecyclerError::IllegalTransition {
                from: order.status,
                event: event.to_string(),
            })
    }

    pub fn accepts(&self, status: RecycleStatus, event: OrderEvent) -> bool {
        self.table.contains_key(&(status, event))
    }
}

/// 流转后需要同步状态的主机范围，`None` 表示主机状态由阶段自己维护
pub fn host_statuses_to_sync(to: RecycleStatus) -> Option<Vec<RecycleStatus>> {
    match to {
        RecycleStatus::Detecting
        | RecycleStatus::DetectFailed
        | RecycleStatus::Transiting
        | RecycleStatus::Returning => None,
        RecycleStatus::Terminate => Some(
            RecycleStatus::ALL
                .into_iter()
                .filter(|s| !s.is_terminal())
                .collect(),
        ),
        _ => Some(
            RecycleStatus::ALL
                .into_iter()
                .filter(|s| !s.is_terminal() && *s != RecycleStatus::DetectFailed)
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use recycler_core::models::{RecycleType, ResourceType};

    use super::*;

    fn order(status: RecycleStatus) -> RecycleOrder {
        let mut order = RecycleOrder::new(
            "1-1",
            1,
            100,
            ResourceType::Cvm,
            RecycleType::Regular,
            ReturnPlan::Immediate,
        );
        order.status = status;
        order.stage = status.stage();
        order
    }

    #[test]
    fn test_default_table_is_valid() {
        let sm = OrderStateMachine::new().unwrap();
        assert!(sm.accepts(RecycleStatus::Uncommit, OrderEvent::Submit));
        assert!(!sm.accepts(RecycleStatus::Done, OrderEvent::Terminate));
    }

    #[test]
    fn test_happy_path() {
        let sm = OrderStateMachine::new().unwrap();
        let steps = [
            (RecycleStatus::Uncommit, OrderEvent::Submit, RecycleStatus::Committed),
            (RecycleStatus::Committed, OrderEvent::CommitSuccess, RecycleStatus::Detecting),
            (RecycleStatus::Detecting, OrderEvent::DetectSuccess, RecycleStatus::Audit),
            (RecycleStatus::Audit, OrderEvent::AuditApprove, RecycleStatus::Transiting),
            (RecycleStatus::Transiting, OrderEvent::TransitSuccess, RecycleStatus::Returning),
            (RecycleStatus::Returning, OrderEvent::ReturnSuccess, RecycleStatus::Done),
        ];
        for (from, event, to) in steps {
            assert_eq!(sm.resolve(&order(from), event).unwrap().to, to, "{from} + {event}");
        }
    }

    #[test]
    fn test_delayed_return_guard() {
        let sm = OrderStateMachine::new().unwrap();
        let mut o = order(RecycleStatus::Transiting);
        o.return_plan = ReturnPlan::Delay;
        let t = sm.resolve(&o, OrderEvent::TransitSuccess).unwrap();
        assert_eq!(t.to, RecycleStatus::ReturningPlan);
        assert_eq!(t.guard, Some(Guard::DelayedReturn));
    }

    #[test]
    fn test_resume_retries_failed_return() {
        let sm = OrderStateMachine::new().unwrap();
        let t = sm
            .resolve(&order(RecycleStatus::ReturnFailed), OrderEvent::Resume)
            .unwrap();
        assert_eq!(t.to, RecycleStatus::Returning);
        assert_eq!(t.action, Action::RetryReturn);
    }

    #[test]
    fn test_skip_confirm_guard() {
        let sm = OrderStateMachine::new().unwrap();
        let mut o = order(RecycleStatus::Detecting);
        let t = sm.resolve(&o, OrderEvent::DetectSuccess).unwrap();
        assert_eq!(t.action, Action::EnterAudit);
        assert!(!Guard::SkipConfirm.check(&o));

        o.skip_confirm = true;
        assert!(Guard::SkipConfirm.check(&o));
    }

    #[test]
    fn test_illegal_transition() {
        let sm = OrderStateMachine::new().unwrap();
        let err = sm
            .resolve(&order(RecycleStatus::Audit), OrderEvent::DetectSuccess)
            .unwrap_err();
        assert!(matches!(err, RecyclerError::IllegalTransition { from: RecycleStatus::Audit, .. }));
        assert!(sm.resolve(&order(RecycleStatus::Done), OrderEvent::Terminate).is_err());
    }

    #[test]
    fn test_every_non_terminal_status_can_terminate() {
        let sm = OrderStateMachine::new().unwrap();
        for status in RecycleStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let t = sm.resolve(&order(status), OrderEvent::Terminate).unwrap();
            assert_eq!(t.to, RecycleStatus::Terminate);
            assert_eq!(t.action, Action::CancelAll);
        }
    }

    #[test]
    fn test_construction_rejects_duplicates_and_missing_fallback() {
        let dup = vec![
            row(RecycleStatus::Audit, OrderEvent::AuditReject, None, RecycleStatus::Rejected, Action::None),
            row(RecycleStatus::Audit, OrderEvent::AuditReject, None, RecycleStatus::Terminate, Action::None),
        ];
        assert!(OrderStateMachine::with_transitions(dup).is_err());

        let guarded_only = vec![row(
            RecycleStatus::Transiting,
            OrderEvent::TransitSuccess,
            Some(Guard::DelayedReturn),
            RecycleStatus::ReturningPlan,
            Action::Enqueue,
        )];
        assert!(OrderStateMachine::with_transitions(guarded_only).is_err());

        let from_terminal = vec![row(
            RecycleStatus::Done,
            OrderEvent::Resume,
            None,
            RecycleStatus::Returning,
            Action::None,
        )];
        assert!(OrderStateMachine::with_transitions(from_terminal).is_err());
    }

    #[test]
    fn test_host_sync_scope() {
        assert!(host_statuses_to_sync(RecycleStatus::Detecting).is_none());
        assert!(host_statuses_to_sync(RecycleStatus::Returning).is_none());

        let audit = host_statuses_to_sync(RecycleStatus::Audit).unwrap();
        assert!(!audit.contains(&RecycleStatus::DetectFailed));
        assert!(!audit.contains(&RecycleStatus::Done));

        let terminate = host_statuses_to_sync(RecycleStatus::Terminate).unwrap();
        assert!(terminate.contains(&RecycleStatus::DetectFailed));
    }
}
