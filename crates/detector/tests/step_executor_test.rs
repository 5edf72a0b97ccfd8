use std::sync::Arc;
use std::time::Duration;

use recycler_core::models::{
    DetectStep, DetectStepStatus, DetectTask, StepFilter, StepName,
};
use recycler_core::{NoopMetrics, RecyclerError, StepMetrics};
use recycler_detector::{
    CheckerWorkGroup, RateLimiter, StepExecutor, StepExecutorConfig, StepMeta,
    StepResultHandler, WaitList, WorkGroup,
};
use recycler_testing_utils::{CountingMetrics, ScriptedChecker, TestEnv, TestStore};

fn executor_config(step_name: StepName, max_retry_times: u32) -> StepExecutorConfig {
    StepExecutorConfig {
        step_name,
        batch_size: 10,
        retry_interval: Duration::from_secs(1),
        max_retry_times,
        retry_jitter_factor: 0.0,
    }
}

fn build_executor(store: &TestStore, config: StepExecutorConfig) -> Arc<StepExecutor> {
    Arc::new(StepExecutor::new(
        config,
        Arc::new(RateLimiter::new(1000.0, 100).unwrap()),
        Arc::new(WaitList::new()),
        store.repos.detect_steps.clone(),
        Arc::new(NoopMetrics),
    ))
}

fn step_meta(suborder_id: &str, host_id: i64, step_name: StepName) -> StepMeta {
    let task = DetectTask::new(
        format!("DT{host_id}"),
        suborder_id,
        host_id,
        "10.0.0.1",
        "TC0001",
    );
    StepMeta::new(DetectStep::new(&task, step_name, 1), &task.ip, &task.asset_id)
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound_is_max_retry_plus_one() {
    let store = TestStore::new();
    let meta = step_meta("1-1", 1001, StepName::CheckUwork);
    store
        .repos
        .detect_steps
        .create_many(&[meta.step.clone()])
        .await
        .unwrap();

    let executor = build_executor(&store, executor_config(StepName::CheckUwork, 2));
    let checker = Arc::new(ScriptedChecker::flaky("接口超时"));
    let metrics = Arc::new(CountingMetrics::new());
    let work_group: Arc<dyn WorkGroup> = Arc::new(
        CheckerWorkGroup::new(
            StepName::CheckUwork,
            checker.clone(),
            2,
            metrics.clone() as Arc<dyn StepMetrics>,
        )
        .unwrap(),
    );

    let (_shutdown_tx, shutdown_rx) = TestEnv::shutdown_channel();
    let handle = executor.clone().start(work_group, shutdown_rx);

    let mut results = executor.submit_steps("1-1", "rid-1", vec![meta]).unwrap();
    let result = results.recv().await.expect("应收到最终结果");
    assert_eq!(result.error.as_deref(), Some("接口超时"));
    assert!(results.recv().await.is_none(), "计数归零后通道应关闭");

    assert_eq!(checker.calls_for(1001), 3);
    assert_eq!(metrics.error_count(StepName::CheckUwork), 3);
    assert!(!executor.is_registered("1-1"));

    let steps = store
        .repos
        .detect_steps
        .find(&StepFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(steps[0].status, DetectStepStatus::Failed);
    assert_eq!(steps[0].retry_time, 2);
    assert!(steps[0].end_at.is_some());

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success() {
    let store = TestStore::new();
    let executor = build_executor(&store, executor_config(StepName::CheckSafety, 3));
    let checker = Arc::new(ScriptedChecker::passing().with_script(
        1001,
        vec![recycler_core::CheckReport::transient("503")],
    ));
    let work_group: Arc<dyn WorkGroup> = Arc::new(
        CheckerWorkGroup::new(StepName::CheckSafety, checker.clone(), 1, Arc::new(NoopMetrics))
            .unwrap(),
    );
    let (_shutdown_tx, shutdown_rx) = TestEnv::shutdown_channel();
    let handle = executor.clone().start(work_group, shutdown_rx);

    let mut results = executor
        .submit_steps("1-1", "rid-1", vec![step_meta("1-1", 1001, StepName::CheckSafety)])
        .unwrap();
    let result = results.recv().await.unwrap();
    assert!(result.is_success());
    assert_eq!(checker.calls_for(1001), 2);

    handle.abort();
}

#[tokio::test]
async fn test_duplicate_submission_is_rejected() {
    let store = TestStore::new();
    let executor = build_executor(&store, executor_config(StepName::BasicCheck, 0));

    let _first = executor
        .submit_steps("1-1", "rid-1", vec![step_meta("1-1", 1001, StepName::BasicCheck)])
        .unwrap();
    let second =
        executor.submit_steps("1-1", "rid-2", vec![step_meta("1-1", 1001, StepName::BasicCheck)]);
    assert!(matches!(
        second,
        Err(RecyclerError::DuplicateSubmission { ref suborder_id, step: StepName::BasicCheck })
            if suborder_id == "1-1"
    ));

    // 另一个子单不受影响
    assert!(executor
        .submit_steps("2-1", "rid-3", vec![step_meta("2-1", 2001, StepName::BasicCheck)])
        .is_ok());
}

#[tokio::test]
async fn test_mismatched_step_is_rejected() {
    let store = TestStore::new();
    let executor = build_executor(&store, executor_config(StepName::BasicCheck, 0));
    let result =
        executor.submit_steps("1-1", "rid-1", vec![step_meta("1-1", 1001, StepName::PreCheck)]);
    assert!(matches!(result, Err(RecyclerError::StepMismatch { .. })));
    assert!(!executor.is_registered("1-1"));
}

#[tokio::test]
async fn test_result_after_cancel_is_dropped() {
    let store = TestStore::new();
    let executor = build_executor(&store, executor_config(StepName::BasicCheck, 0));

    let mut meta = step_meta("1-1", 1001, StepName::BasicCheck);
    let mut results = executor.submit_steps("1-1", "rid-1", vec![meta.clone()]).unwrap();
    assert!(executor.cancel_suborder("1-1"));
    assert!(!executor.cancel_suborder("1-1"));

    meta.rid = "rid-1".to_string();
    executor
        .handle_result(vec![meta], None, "late".to_string(), false)
        .await;

    assert!(results.recv().await.is_none());
    assert!(!executor.is_registered("1-1"));
}

#[tokio::test]
async fn test_result_with_stale_rid_is_dropped() {
    let store = TestStore::new();
    let executor = build_executor(&store, executor_config(StepName::BasicCheck, 0));

    let mut results = executor
        .submit_steps("1-1", "rid-new", vec![step_meta("1-1", 1001, StepName::BasicCheck)])
        .unwrap();

    let mut stale = step_meta("1-1", 1001, StepName::BasicCheck);
    stale.rid = "rid-old".to_string();
    executor
        .handle_result(vec![stale], Some("旧结果".to_string()), String::new(), false)
        .await;
    assert!(results.try_recv().is_err());
    assert!(executor.is_registered("1-1"));

    let mut current = step_meta("1-1", 1001, StepName::BasicCheck);
    current.rid = "rid-new".to_string();
    executor
        .handle_result(vec![current], None, String::new(), false)
        .await;
    assert!(results.recv().await.unwrap().is_success());
    assert!(!executor.is_registered("1-1"));
}

#[tokio::test]
async fn test_result_does_not_overwrite_reset_step() {
    let store = TestStore::new();
    let executor = build_executor(&store, executor_config(StepName::BasicCheck, 0));

    // 步骤已被暂停重置为初始状态，迟到的结果不能再写回
    let mut meta = step_meta("1-1", 1001, StepName::BasicCheck);
    store
        .repos
        .detect_steps
        .create_many(&[meta.step.clone()])
        .await
        .unwrap();
    let mut results = executor.submit_steps("1-1", "rid-1", vec![meta.clone()]).unwrap();

    meta.rid = "rid-1".to_string();
    executor
        .handle_result(vec![meta], Some("不通过".to_string()), String::new(), false)
        .await;
    assert!(results.recv().await.is_some());

    let steps = store
        .repos
        .detect_steps
        .find(&StepFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(steps[0].status, DetectStepStatus::Init);
    assert!(steps[0].end_at.is_none());
}

#[tokio::test]
async fn test_dispatch_reports_wait_list_depth() {
    let store = TestStore::new();
    let metrics = Arc::new(CountingMetrics::new());
    let executor = Arc::new(StepExecutor::new(
        executor_config(StepName::BasicCheck, 0),
        Arc::new(RateLimiter::new(1000.0, 100).unwrap()),
        Arc::new(WaitList::new()),
        store.repos.detect_steps.clone(),
        metrics.clone() as Arc<dyn StepMetrics>,
    ));
    let work_group: Arc<dyn WorkGroup> = Arc::new(
        CheckerWorkGroup::new(
            StepName::BasicCheck,
            Arc::new(ScriptedChecker::passing()),
            1,
            Arc::new(NoopMetrics),
        )
        .unwrap(),
    );
    assert_eq!(metrics.wait_list_depth(StepName::BasicCheck), None);

    let (_shutdown_tx, shutdown_rx) = TestEnv::shutdown_channel();
    let handle = executor.clone().start(work_group, shutdown_rx);
    let mut results = executor
        .submit_steps("1-1", "rid-1", vec![step_meta("1-1", 1001, StepName::BasicCheck)])
        .unwrap();
    assert!(results.recv().await.unwrap().is_success());
    assert_eq!(metrics.wait_list_depth(StepName::BasicCheck), Some(0));

    handle.abort();
}
