use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use recycler_core::models::{
    DetectStepCfg, DetectStepStatus, DetectTaskFilter, DetectTaskStatus, HostFilter,
    RecycleStatus, StepFilter, StepName, StepUpdate,
};
use recycler_core::{DetectorConfig, RecyclerError, StepChecker, StepMetrics};
use recycler_detector::{Detector, ExecutorRegistry, PreChecker};
use recycler_testing_utils::{
    CountingMetrics, OrderBuilder, ScriptedChecker, StepCfgBuilder, TestEnv, TestStore,
};

struct Harness {
    store: TestStore,
    detector: Detector,
    _shutdown: broadcast::Sender<()>,
}

async fn harness(cfgs: Vec<DetectStepCfg>, checkers: Vec<(StepName, Arc<dyn StepChecker>)>) -> Harness {
    let store = TestStore::new();
    store.seed_step_cfgs(&cfgs).await.unwrap();

    let checkers: HashMap<StepName, Arc<dyn StepChecker>> = checkers.into_iter().collect();
    let config = DetectorConfig {
        retry_jitter_factor: 0.0,
        ..Default::default()
    };
    let registry = Arc::new(
        ExecutorRegistry::build(
            &cfgs,
            &checkers,
            store.repos.detect_steps.clone(),
            Arc::new(CountingMetrics::new()) as Arc<dyn StepMetrics>,
            &config,
        )
        .unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = TestEnv::shutdown_channel();
    registry.start(&shutdown_rx);

    let detector = Detector::new(store.repos.clone(), registry, Some(config));
    Harness {
        store,
        detector,
        _shutdown: shutdown_tx,
    }
}

fn entry<C: StepChecker + 'static>(name: StepName, checker: Arc<C>) -> (StepName, Arc<dyn StepChecker>) {
    (name, checker)
}

fn default_cfgs() -> Vec<DetectStepCfg> {
    vec![
        StepCfgBuilder::new(StepName::PreCheck, 1).build(),
        StepCfgBuilder::new(StepName::BasicCheck, 2).build(),
    ]
}

#[tokio::test]
async fn test_detect_single_host_all_pass() {
    let basic = Arc::new(ScriptedChecker::passing());
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, basic.clone()),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1")
        .with_status(RecycleStatus::Detecting)
        .build();
    h.store.seed_order(&order, 1).await.unwrap();

    let summary = h.detector.detect(&order).await.unwrap();
    assert!(summary.passed());
    assert_eq!((summary.success, summary.failed), (1, 0));

    let tasks = h
        .store
        .repos
        .detect_tasks
        .find(&DetectTaskFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, DetectTaskStatus::Success);
    assert_eq!(tasks[0].success_num + tasks[0].failed_num, tasks[0].total_num);
    assert_eq!(tasks[0].pending_num, 0);

    h.detector.check_detect_status("1-1").await.unwrap();
    let stored = h.store.order("1-1").await.unwrap();
    assert_eq!(stored.success_num, 1);
    assert_eq!(stored.failed_num, 0);
    assert!(stored.counts_consistent());
}

#[tokio::test]
async fn test_detect_policy_failure_marks_host() {
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, Arc::new(ScriptedChecker::rejecting("has policy"))),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1")
        .with_status(RecycleStatus::Detecting)
        .build();
    h.store.seed_order(&order, 1).await.unwrap();

    let summary = h.detector.detect(&order).await.unwrap();
    assert_eq!(summary.failed, 1);

    let tasks = h
        .store
        .repos
        .detect_tasks
        .find(&DetectTaskFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(tasks[0].status, DetectTaskStatus::Failed);
    assert!(tasks[0].message.contains("has policy"));

    let hosts = h
        .store
        .repos
        .hosts
        .find(&HostFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(hosts[0].status, RecycleStatus::DetectFailed);

    let err = h.detector.check_detect_status("1-1").await.unwrap_err();
    assert!(matches!(err, RecyclerError::DetectNotPassed { failed: 1, .. }));
    assert_eq!(h.store.order("1-1").await.unwrap().failed_num, 1);
}

#[tokio::test]
async fn test_failure_is_sticky_and_counters_balance() {
    // 1002 的 CheckSafety 失败，其余步骤全部成功
    let safety = ScriptedChecker::passing()
        .with_script(1002, vec![recycler_core::CheckReport::rejected("基线不合规", "")]);
    let h = harness(
        vec![
            StepCfgBuilder::new(StepName::PreCheck, 1).build(),
            StepCfgBuilder::new(StepName::CheckSafety, 2).build(),
            StepCfgBuilder::new(StepName::CheckOwner, 3).build(),
        ],
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::CheckSafety, Arc::new(safety)),
            entry(StepName::CheckOwner, Arc::new(ScriptedChecker::passing())),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1")
        .with_status(RecycleStatus::Detecting)
        .build();
    h.store.seed_order(&order, 3).await.unwrap();

    let summary = h.detector.detect(&order).await.unwrap();
    assert_eq!((summary.total, summary.success, summary.failed), (3, 2, 1));

    let tasks = h
        .store
        .repos
        .detect_tasks
        .find(&DetectTaskFilter::by_suborder("1-1"))
        .await
        .unwrap();
    for task in &tasks {
        assert_eq!(task.total_num, 3);
        assert_eq!(task.success_num + task.failed_num, 3);
        assert_eq!(task.pending_num, 0);
        if task.host_id == 1002 {
            assert_eq!(task.status, DetectTaskStatus::Failed);
            assert_eq!(task.failed_num, 1);
        } else {
            assert_eq!(task.status, DetectTaskStatus::Success);
        }
    }
}

#[tokio::test]
async fn test_redetect_skips_passed_steps_except_pre_check() {
    let pre = Arc::new(ScriptedChecker::passing());
    let basic = Arc::new(ScriptedChecker::passing());
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, pre.clone()),
            entry(StepName::BasicCheck, basic.clone()),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1").build();
    h.store.seed_order(&order, 2).await.unwrap();

    h.detector.detect(&order).await.unwrap();
    let summary = h.detector.detect(&order).await.unwrap();
    assert!(summary.passed());

    assert_eq!(pre.total_calls(), 4);
    assert_eq!(basic.total_calls(), 2);
}

#[tokio::test]
async fn test_retry_on_success_reruns_step() {
    let basic = Arc::new(ScriptedChecker::passing());
    let h = harness(
        vec![
            StepCfgBuilder::new(StepName::PreCheck, 1).build(),
            StepCfgBuilder::new(StepName::BasicCheck, 2)
                .with_retry_on_success(true)
                .build(),
        ],
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, basic.clone()),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1").build();
    h.store.seed_order(&order, 1).await.unwrap();
    h.detector.detect(&order).await.unwrap();
    h.detector.detect(&order).await.unwrap();
    assert_eq!(basic.total_calls(), 2);
}

#[tokio::test]
async fn test_running_step_blocks_detect_until_resumed() {
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, Arc::new(ScriptedChecker::passing())),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1").build();
    h.store.seed_order(&order, 1).await.unwrap();
    h.detector.detect(&order).await.unwrap();

    // 模拟进程在步骤执行中崩溃
    h.store
        .repos
        .detect_steps
        .update(
            &StepFilter::by_suborder("1-1").with_step(StepName::BasicCheck),
            &StepUpdate::status(DetectStepStatus::Running),
        )
        .await
        .unwrap();

    let err = h.detector.detect(&order).await.unwrap_err();
    assert!(matches!(err, RecyclerError::StepAlreadyRunning { .. }));

    let summary = h.detector.resume(&order).await.unwrap();
    assert!(summary.passed());
}

#[tokio::test]
async fn test_prepare_creates_tasks_once() {
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, Arc::new(ScriptedChecker::passing())),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1").build();
    h.store.seed_order(&order, 3).await.unwrap();
    assert_eq!(h.detector.prepare(&order).await.unwrap(), 3);
    assert_eq!(h.detector.prepare(&order).await.unwrap(), 0);

    let init = h
        .store
        .repos
        .detect_tasks
        .count(&DetectTaskFilter::by_suborder("1-1").with_statuses(&[DetectTaskStatus::Init]))
        .await
        .unwrap();
    assert_eq!(init, 3);
}

#[tokio::test]
async fn test_remove_failed_hosts() {
    let basic = ScriptedChecker::passing()
        .with_script(1001, vec![recycler_core::CheckReport::rejected("负责人不符", "")]);
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, Arc::new(basic)),
        ],
    )
    .await;

    let order = OrderBuilder::new("1-1").build();
    h.store.seed_order(&order, 2).await.unwrap();
    h.detector.detect(&order).await.unwrap();

    assert_eq!(h.detector.remove_failed_hosts("1-1").await.unwrap(), 1);
    let hosts = h
        .store
        .repos
        .hosts
        .find(&HostFilter::by_suborder("1-1"))
        .await
        .unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].host_id, 1002);

    let stored = h.store.order("1-1").await.unwrap();
    assert_eq!(stored.total_num, 1);
    h.detector.check_detect_status("1-1").await.unwrap();
}

#[tokio::test]
async fn test_detect_without_hosts_passes() {
    let h = harness(
        default_cfgs(),
        vec![
            entry(StepName::PreCheck, Arc::new(PreChecker::default())),
            entry(StepName::BasicCheck, Arc::new(ScriptedChecker::passing())),
        ],
    )
    .await;
    let order = OrderBuilder::new("1-1").build();
    h.store.seed_order(&order, 0).await.unwrap();

    let summary = h.detector.detect(&order).await.unwrap();
    assert_eq!(summary.total, 0);
    h.detector.check_detect_status("1-1").await.unwrap();
}

#[test]
fn test_registry_rejects_missing_checker() {
    let store = TestStore::new();
    let checkers: HashMap<StepName, Arc<dyn StepChecker>> =
        HashMap::from([entry(StepName::PreCheck, Arc::new(PreChecker::default()))]);
    let result = ExecutorRegistry::build(
        &default_cfgs(),
        &checkers,
        store.repos.detect_steps.clone(),
        Arc::new(CountingMetrics::new()),
        &DetectorConfig::default(),
    );
    assert!(matches!(result, Err(RecyclerError::UnsupportedStep(ref s)) if s == "BasicCheck"));
}

#[test]
fn test_registry_rejects_oversized_batch() {
    let store = TestStore::new();
    let checkers: HashMap<StepName, Arc<dyn StepChecker>> = HashMap::from([(
        StepName::BasicCheck,
        Arc::new(ScriptedChecker::passing().with_max_batch_size(5)) as Arc<dyn StepChecker>,
    )]);
    let cfgs = vec![StepCfgBuilder::new(StepName::BasicCheck, 1)
        .with_batch_size(20)
        .build()];
    let result = ExecutorRegistry::build(
        &cfgs,
        &checkers,
        store.repos.detect_steps.clone(),
        Arc::new(CountingMetrics::new()),
        &DetectorConfig::default(),
    );
    assert!(matches!(result, Err(RecyclerError::Configuration(_))));
}

#[test]
fn test_registry_skips_disabled_steps() {
    let store = TestStore::new();
    let checkers: HashMap<StepName, Arc<dyn StepChecker>> = HashMap::new();
    let cfgs = vec![StepCfgBuilder::new(StepName::CheckIpReclaim, 1).disabled().build()];
    let registry = ExecutorRegistry::build(
        &cfgs,
        &checkers,
        store.repos.detect_steps.clone(),
        Arc::new(CountingMetrics::new()),
        &DetectorConfig::default(),
    )
    .unwrap();
    assert!(registry.step_names().is_empty());
}

#[test]
fn test_registry_rejects_duplicate_sequence() {
    let store = TestStore::new();
    let checkers: HashMap<StepName, Arc<dyn StepChecker>> = HashMap::from([
        entry(StepName::PreCheck, Arc::new(PreChecker::default())),
        entry(StepName::BasicCheck, Arc::new(ScriptedChecker::rejecting("不通过"))),
    ]);
    let cfgs = vec![
        StepCfgBuilder::new(StepName::PreCheck, 1).build(),
        StepCfgBuilder::new(StepName::BasicCheck, 1).build(),
    ];
    let result = ExecutorRegistry::build(
        &cfgs,
        &checkers,
        store.repos.detect_steps.clone(),
        Arc::new(CountingMetrics::new()),
        &DetectorConfig::default(),
    );
    assert!(matches!(result, Err(RecyclerError::Configuration(ref msg)) if msg.contains("序号 1 重复")));
}
