mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use recycler_core::models::{
    DetectStepStatus, DetectTaskFilter, DetectTaskStatus, RecycleStatus, ReturnPlan, ReturnTask,
    ReturnTaskStatus, ReturnTaskUpdate, StepFilter,
};
use recycler_core::{RecoveryConfig, ReturnState};
use recycler_dispatcher::{RecoveryAction, RecoveryService, SystemRecoveryService};
use recycler_testing_utils::{
    FakeReturnProvider, FixedLeader, HostBuilder, OrderBuilder, ScriptedChecker, TestEnv,
};

use common::Harness;

fn recovery(h: &Harness, leader: Arc<FixedLeader>) -> SystemRecoveryService {
    SystemRecoveryService::new(
        h.store.repos.clone(),
        h.dispatcher.clone(),
        leader,
        Some(RecoveryConfig {
            master_poll_interval_seconds: 1,
            ..Default::default()
        }),
    )
}

/// 回收单、主机、检测任务、退回任务的持久化状态
async fn snapshot(h: &Harness, suborder_id: &str) -> String {
    let order = h.store.order(suborder_id).await.unwrap();
    let mut tasks: Vec<(String, DetectTaskStatus)> = h
        .store
        .repos
        .detect_tasks
        .find(&DetectTaskFilter::by_suborder(suborder_id))
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.task_id, t.status))
        .collect();
    tasks.sort_by(|a, b| a.0.cmp(&b.0));
    let return_task = h
        .store
        .repos
        .return_tasks
        .get(suborder_id)
        .await
        .unwrap()
        .map(|t| (t.status, t.task_id));
    format!(
        "{:?} {}/{}/{}/{} {:?} {:?} {:?}",
        order.status,
        order.total_num,
        order.success_num,
        order.failed_num,
        order.pending_num,
        h.host_statuses(suborder_id).await,
        tasks,
        return_task
    )
}

async fn assert_idempotent(h: &Harness, service: &SystemRecoveryService, suborder_id: &str) {
    service.recover_order(suborder_id).await.unwrap();
    let once = snapshot(h, suborder_id).await;
    service.recover_order(suborder_id).await.unwrap();
    let twice = snapshot(h, suborder_id).await;
    assert_eq!(once, twice);
}

#[tokio::test]
async fn test_detecting_without_detecting_hosts_is_requeued() {
    let h = Harness::new(ScriptedChecker::passing()).await;
    let order = OrderBuilder::new("1-1")
        .with_status(RecycleStatus::Detecting)
        .build();
    let hosts: Vec<_> = (0..2)
        .map(|i| {
            HostBuilder::for_order(&order, 1001 + i)
                .with_status(RecycleStatus::Committed)
                .build()
        })
        .collect();
    h.store.repos.orders.create(&order).await.unwrap();
    h.store.repos.hosts.create_many(&hosts).await.unwrap();

    let service = recovery(&h, Arc::new(FixedLeader::new(true)));
    let action = service.recover_order("1-1").await.unwrap();

    assert_eq!(action, RecoveryAction::Enqueued);
    assert_eq!(h.dispatcher.queue_len(), 1);
    assert_eq!(h.status("1-1").await, Some(RecycleStatus::Detecting));
    assert_eq!(h.metrics.recovered(), vec![(RecycleStatus::Detecting, true)]);
    let steps = h
        .store
        .repos
        .detect_steps
        .count(&StepFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(steps, 0);
}

#[tokio::test]
async fn test_detecting_resumes_interrupted_steps() {
    let h = Harness::new(ScriptedChecker::passing()).await;
    let order = OrderBuilder::new("2-1").build();
    h.seed(&order, 2).await;

    // 模拟崩溃：检测已开始，一个步骤停留在运行中
    h.dispatcher.detector().prepare(&order).await.unwrap();
    let detecting = OrderBuilder::new("2-1")
        .with_status(RecycleStatus::Detecting)
        .build();
    h.dispatcher.detector().detect(&detecting).await.unwrap();
    h.store
        .repos
        .orders
        .update(
            &recycler_core::models::OrderFilter::by_suborder("2-1"),
            &recycler_core::models::OrderUpdate::status(RecycleStatus::Detecting, ""),
        )
        .await
        .unwrap();
    h.store
        .repos
        .detect_steps
        .update(
            &StepFilter::by_suborder("2-1"),
            &recycler_core::models::StepUpdate::status(DetectStepStatus::Running),
        )
        .await
        .unwrap();

    let service = recovery(&h, Arc::new(FixedLeader::new(true)));
    let action = service.recover_order("2-1").await.unwrap();
    assert_eq!(action, RecoveryAction::Replayed);
    assert_eq!(h.status("2-1").await, Some(RecycleStatus::Audit));

    assert_idempotent(&h, &service, "2-1").await;
}

#[tokio::test]
async fn test_committed_recovery_is_idempotent() {
    let h = Harness::new(ScriptedChecker::passing()).await;

    let without_tasks = OrderBuilder::new("3-1")
        .with_status(RecycleStatus::Committed)
        .build();
    h.seed(&without_tasks, 1).await;
    let with_tasks = OrderBuilder::new("3-2")
        .with_status(RecycleStatus::Committed)
        .build();
    h.seed(&with_tasks, 2).await;
    h.dispatcher.detector().prepare(&with_tasks).await.unwrap();

    let service = recovery(&h, Arc::new(FixedLeader::new(true)));
    assert_eq!(
        service.recover_order("3-1").await.unwrap(),
        RecoveryAction::Enqueued
    );
    assert_eq!(h.status("3-1").await, Some(RecycleStatus::Committed));

    assert_eq!(
        service.recover_order("3-2").await.unwrap(),
        RecoveryAction::Replayed
    );
    assert_eq!(h.status("3-2").await, Some(RecycleStatus::Detecting));

    assert_idempotent(&h, &service, "3-1").await;
    assert_idempotent(&h, &service, "3-2").await;
}

#[tokio::test]
async fn test_transiting_recovery_is_idempotent() {
    let h = Harness::new(ScriptedChecker::passing()).await;
    let order = OrderBuilder::new("4-1")
        .with_status(RecycleStatus::Transiting)
        .build();
    h.seed(&order, 2).await;

    let service = recovery(&h, Arc::new(FixedLeader::new(true)));
    let action = service.recover_order("4-1").await.unwrap();
    assert_eq!(action, RecoveryAction::Replayed);
    assert_eq!(h.status("4-1").await, Some(RecycleStatus::Returning));
    assert_eq!(h.cmdb.transfer_count(), 1);

    assert_idempotent(&h, &service, "4-1").await;
    assert_eq!(h.cmdb.transfer_count(), 1);
    assert_eq!(h.provider.created_count(), 0);
}

#[tokio::test]
async fn test_returning_recovery_branches_on_return_task() {
    let h = Harness::with_provider(
        ScriptedChecker::passing(),
        FakeReturnProvider::new(ReturnState::Running),
    )
    .await;
    let service = recovery(&h, Arc::new(FixedLeader::new(true)));

    let no_task = OrderBuilder::new("5-1")
        .with_status(RecycleStatus::Returning)
        .build();
    h.seed(&no_task, 1).await;
    assert_eq!(
        service.recover_order("5-1").await.unwrap(),
        RecoveryAction::Enqueued
    );

    let running = OrderBuilder::new("5-2")
        .with_status(RecycleStatus::Returning)
        .build();
    h.seed(&running, 1).await;
    h.store
        .repos
        .return_tasks
        .create(&ReturnTask::new("5-2", running.resource_type))
        .await
        .unwrap();
    h.store
        .repos
        .return_tasks
        .update(
            "5-2",
            &ReturnTaskUpdate {
                status: Some(ReturnTaskStatus::Running),
                task_id: Some("RT-5-2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        service.recover_order("5-2").await.unwrap(),
        RecoveryAction::Waiting
    );
    assert_eq!(h.status("5-2").await, Some(RecycleStatus::Returning));

    h.provider.set_state(ReturnState::Success);
    assert_eq!(
        service.recover_order("5-2").await.unwrap(),
        RecoveryAction::Replayed
    );
    assert_eq!(h.status("5-2").await, Some(RecycleStatus::Done));
    assert_eq!(
        h.host_statuses("5-2").await,
        vec![(1001, RecycleStatus::Done)]
    );
    assert_eq!(h.provider.created_count(), 0);

    assert_eq!(
        service.recover_order("5-2").await.unwrap(),
        RecoveryAction::Skipped
    );
}

#[tokio::test]
async fn test_returning_plan_recovery_is_idempotent() {
    let h = Harness::new(ScriptedChecker::passing()).await;
    let order = OrderBuilder::new("6-1")
        .with_status(RecycleStatus::ReturningPlan)
        .with_return_plan(ReturnPlan::Delay)
        .build();
    h.seed(&order, 1).await;

    let service = recovery(&h, Arc::new(FixedLeader::new(true)));
    assert_idempotent(&h, &service, "6-1").await;
    assert_eq!(h.status("6-1").await, Some(RecycleStatus::Done));
    assert_eq!(h.provider.planned(), vec!["6-1".to_string()]);
}

#[tokio::test]
async fn test_recover_system_state_respects_window() {
    let h = Harness::new(ScriptedChecker::passing()).await;
    let now = Utc::now();

    let recent = OrderBuilder::new("7-1")
        .with_status(RecycleStatus::Committed)
        .created_at(now - chrono::Duration::days(2))
        .build();
    let too_old = OrderBuilder::new("7-2")
        .with_status(RecycleStatus::Committed)
        .created_at(now - chrono::Duration::days(30))
        .build();
    let finished = OrderBuilder::new("7-3")
        .with_status(RecycleStatus::Done)
        .created_at(now - chrono::Duration::days(1))
        .build();
    for order in [&recent, &too_old, &finished] {
        h.seed(order, 1).await;
    }

    let service = recovery(&h, Arc::new(FixedLeader::new(true)));
    let report = service.recover_system_state().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered, vec![("7-1".to_string(), RecoveryAction::Enqueued)]);
    assert!(report.errors.is_empty());
    assert_eq!(h.dispatcher.queue_len(), 1);
}

#[tokio::test]
async fn test_recovery_waits_for_master() {
    let h = Harness::new(ScriptedChecker::passing()).await;
    let order = OrderBuilder::new("8-1")
        .with_status(RecycleStatus::Committed)
        .created_at(Utc::now() - chrono::Duration::hours(1))
        .build();
    h.seed(&order, 1).await;

    let leader = Arc::new(FixedLeader::new(false));
    let service = Arc::new(recovery(&h, leader.clone()));
    let handle = service.start(h.shutdown_receiver());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.dispatcher.queue_len(), 0);

    leader.set_master(true);
    let dispatcher = h.dispatcher.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.queue_len() == 1 }
            },
            Duration::from_secs(5),
        )
        .await
    );
    handle.await.unwrap();
}
