#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use recycler_core::models::{
    DetectStepCfg, HostFilter, RecycleHost, RecycleOrder, RecycleStatus, StepName,
};
use recycler_core::{
    DetectorConfig, DispatcherConfig, OrderMetrics, ReturnState, ReturnerConfig, StepChecker,
    StepMetrics,
};
use recycler_detector::{Detector, ExecutorRegistry, PreChecker};
use recycler_dispatcher::{CmdbTransit, Dispatcher, ProviderReturner};
use recycler_testing_utils::{
    CountingMetrics, FakeCmdb, FakeReturnProvider, HostBuilder, ScriptedChecker, StepCfgBuilder,
    TestEnv, TestStore,
};

pub const SOURCE_BIZ: i64 = 100;
pub const SOURCE_MODULE: i64 = 1;

pub struct Harness {
    pub store: TestStore,
    pub cmdb: Arc<FakeCmdb>,
    pub provider: Arc<FakeReturnProvider>,
    pub basic: Arc<ScriptedChecker>,
    pub metrics: Arc<CountingMetrics>,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Harness {
    pub async fn new(basic: ScriptedChecker) -> Self {
        Self::with_provider(basic, FakeReturnProvider::default()).await
    }

    pub async fn with_provider(basic: ScriptedChecker, provider: FakeReturnProvider) -> Self {
        Self::build(basic, provider, 3600).await
    }

    pub async fn with_requeue_delay(basic: ScriptedChecker, requeue_delay_seconds: u64) -> Self {
        Self::build(basic, FakeReturnProvider::default(), requeue_delay_seconds).await
    }

    async fn build(
        basic: ScriptedChecker,
        provider: FakeReturnProvider,
        requeue_delay_seconds: u64,
    ) -> Self {
        let metrics = Arc::new(CountingMetrics::new());
        let store = TestStore::new();
        let cfgs: Vec<DetectStepCfg> = vec![
            StepCfgBuilder::new(StepName::PreCheck, 1).build(),
            StepCfgBuilder::new(StepName::BasicCheck, 2).build(),
        ];
        store.seed_step_cfgs(&cfgs).await.unwrap();

        let basic = Arc::new(basic);
        let mut checkers: HashMap<StepName, Arc<dyn StepChecker>> = HashMap::new();
        checkers.insert(StepName::PreCheck, Arc::new(PreChecker::default()));
        checkers.insert(StepName::BasicCheck, basic.clone());

        let detector_config = DetectorConfig {
            retry_jitter_factor: 0.0,
            result_batch_window_ms: 20,
            ..Default::default()
        };
        let registry = Arc::new(
            ExecutorRegistry::build(
                &cfgs,
                &checkers,
                store.repos.detect_steps.clone(),
                metrics.clone() as Arc<dyn StepMetrics>,
                &detector_config,
            )
            .unwrap(),
        );
        let (shutdown, shutdown_rx) = TestEnv::shutdown_channel();
        registry.start(&shutdown_rx);

        let detector = Arc::new(Detector::new(
            store.repos.clone(),
            registry,
            Some(detector_config),
        ));
        let cmdb = Arc::new(FakeCmdb::new());
        let provider = Arc::new(provider);
        let transit = Arc::new(CmdbTransit::new(store.repos.clone(), cmdb.clone(), None));
        let returner = Arc::new(ProviderReturner::new(
            store.repos.clone(),
            provider.clone(),
            Some(ReturnerConfig {
                poll_interval_seconds: 0,
                max_polls: 1,
            }),
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(
                store.repos.clone(),
                detector,
                transit,
                returner,
                metrics.clone() as Arc<dyn OrderMetrics>,
                Some(DispatcherConfig {
                    max_concurrent_orders: 2,
                    requeue_delay_seconds,
                }),
            )
            .unwrap(),
        );

        Self {
            store,
            cmdb,
            provider,
            basic,
            metrics,
            dispatcher,
            shutdown,
            shutdown_rx,
        }
    }

    pub fn start_dispatcher(&self) {
        self.dispatcher.clone().start(self.shutdown_rx.resubscribe());
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_rx.resubscribe()
    }

    /// 写入回收单和主机，主机在CMDB中位于原业务模块
    pub async fn seed(&self, order: &RecycleOrder, host_count: usize) -> Vec<RecycleHost> {
        let hosts = self.store.seed_order(order, host_count).await.unwrap();
        for host in &hosts {
            self.cmdb.place_host(host.host_id, SOURCE_BIZ, SOURCE_MODULE);
        }
        hosts
    }

    pub fn hosts_for(&self, order: &RecycleOrder, count: usize) -> Vec<RecycleHost> {
        (0..count)
            .map(|i| {
                let host = HostBuilder::for_order(order, 1001 + i as i64).build();
                self.cmdb.place_host(host.host_id, SOURCE_BIZ, SOURCE_MODULE);
                host
            })
            .collect()
    }

    pub async fn status(&self, suborder_id: &str) -> Option<RecycleStatus> {
        self.store.order(suborder_id).await.map(|o| o.status)
    }

    pub async fn wait_status(&self, suborder_id: &str, status: RecycleStatus) -> bool {
        TestEnv::wait_for(
            || async move { self.status(suborder_id).await == Some(status) },
            std::time::Duration::from_secs(5),
        )
        .await
    }

    pub async fn host_statuses(&self, suborder_id: &str) -> Vec<(i64, RecycleStatus)> {
        let mut hosts: Vec<(i64, RecycleStatus)> = self
            .store
            .repos
            .hosts
            .find(&HostFilter::by_suborder(suborder_id))
            .await
            .unwrap()
            .into_iter()
            .map(|h| (h.host_id, h.status))
            .collect();
        hosts.sort_by_key(|(id, _)| *id);
        hosts
    }
}

pub fn failing_provider(msg: &str) -> FakeReturnProvider {
    FakeReturnProvider::new(ReturnState::Failed(msg.to_string()))
}
