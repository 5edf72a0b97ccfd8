//! 外部接口的测试替身

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use recycler_core::models::{RecycleHost, RecycleOrder, RecycleStatus, StepName};
use recycler_core::{
    CheckReport, CheckTarget, CmdbClient, HostTopo, LeaderElector, ModuleInfo, OrderMetrics,
    RecyclerError, RecyclerResult, ReturnOrderRef, ReturnProvider, ReturnState, StepChecker,
    StepMetrics,
};

/// 可编排结果的检测项
///
/// 每台主机可以预置一串结果，用完后返回默认结果。
pub struct ScriptedChecker {
    max_batch_size: usize,
    default_report: CheckReport,
    scripts: Mutex<HashMap<i64, VecDeque<CheckReport>>>,
    calls: Mutex<HashMap<i64, u32>>,
    delay: Option<Duration>,
}

impl ScriptedChecker {
    pub fn new(default_report: CheckReport) -> Self {
        Self {
            max_batch_size: 100,
            default_report,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub fn passing() -> Self {
        Self::new(CheckReport::success("ok"))
    }

    /// 策略性失败，不可重试
    pub fn rejecting(error: &str) -> Self {
        Self::new(CheckReport::rejected(error, ""))
    }

    /// 瞬时失败，可重试
    pub fn flaky(error: &str) -> Self {
        Self::new(CheckReport::transient(error))
    }

    pub fn with_script(self, host_id: i64, reports: Vec<CheckReport>) -> Self {
        self.scripts.lock().insert(host_id, reports.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn calls_for(&self, host_id: i64) -> u32 {
        self.calls.lock().get(&host_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl StepChecker for ScriptedChecker {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn check(&self, target: &CheckTarget) -> CheckReport {
        *self.calls.lock().entry(target.host_id).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .get_mut(&target.host_id)
            .and_then(|script| script.pop_front());
        scripted.unwrap_or_else(|| self.default_report.clone())
    }
}

/// 内存中的CMDB
#[derive(Default)]
pub struct FakeCmdb {
    topo: Mutex<HashMap<i64, HostTopo>>,
    modules: Mutex<HashMap<(i64, i64), ModuleInfo>>,
    transfers: AtomicU32,
    fail_transfer: AtomicBool,
}

impl FakeCmdb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place_host(&self, host_id: i64, bk_biz_id: i64, bk_module_id: i64) {
        self.topo.lock().insert(
            host_id,
            HostTopo {
                host_id,
                bk_biz_id,
                bk_module_id,
            },
        );
    }

    pub fn add_module(&self, bk_biz_id: i64, bk_module_id: i64, name: &str, is_recycle: bool) {
        self.modules.lock().insert(
            (bk_biz_id, bk_module_id),
            ModuleInfo {
                bk_biz_id,
                bk_module_id,
                name: name.to_string(),
                is_recycle,
            },
        );
    }

    pub fn topo_of(&self, host_id: i64) -> Option<HostTopo> {
        self.topo.lock().get(&host_id).cloned()
    }

    pub fn transfer_count(&self) -> u32 {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn set_fail_transfer(&self, fail: bool) {
        self.fail_transfer.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CmdbClient for FakeCmdb {
    async fn get_host_topo(&self, host_ids: &[i64]) -> RecyclerResult<Vec<HostTopo>> {
        let topo = self.topo.lock();
        Ok(host_ids
            .iter()
            .filter_map(|id| topo.get(id).cloned())
            .collect())
    }

    async fn get_module(
        &self,
        bk_biz_id: i64,
        bk_module_id: i64,
    ) -> RecyclerResult<Option<ModuleInfo>> {
        Ok(self.modules.lock().get(&(bk_biz_id, bk_module_id)).cloned())
    }

    async fn transfer_hosts(
        &self,
        host_ids: &[i64],
        _from_biz_id: i64,
        to_biz_id: i64,
        to_module_id: i64,
    ) -> RecyclerResult<()> {
        if self.fail_transfer.load(Ordering::SeqCst) {
            return Err(RecyclerError::ExternalApi("CMDB转移失败".to_string()));
        }
        self.transfers.fetch_add(1, Ordering::SeqCst);
        let mut topo = self.topo.lock();
        for host_id in host_ids {
            topo.insert(
                *host_id,
                HostTopo {
                    host_id: *host_id,
                    bk_biz_id: to_biz_id,
                    bk_module_id: to_module_id,
                },
            );
        }
        Ok(())
    }
}

/// 内存中的退回平台
pub struct FakeReturnProvider {
    state: Mutex<ReturnState>,
    created: AtomicU32,
    queries: AtomicU32,
    plans: Mutex<HashSet<String>>,
    fail_create: AtomicBool,
}

impl Default for FakeReturnProvider {
    fn default() -> Self {
        Self::new(ReturnState::Success)
    }
}

impl FakeReturnProvider {
    pub fn new(state: ReturnState) -> Self {
        Self {
            state: Mutex::new(state),
            created: AtomicU32::new(0),
            queries: AtomicU32::new(0),
            plans: Mutex::new(HashSet::new()),
            fail_create: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, state: ReturnState) {
        *self.state.lock() = state;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn planned(&self) -> Vec<String> {
        let mut plans: Vec<String> = self.plans.lock().iter().cloned().collect();
        plans.sort();
        plans
    }
}

#[async_trait]
impl ReturnProvider for FakeReturnProvider {
    async fn create_return_order(
        &self,
        order: &RecycleOrder,
        _hosts: &[RecycleHost],
    ) -> RecyclerResult<ReturnOrderRef> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RecyclerError::ExternalApi("退回单创建失败".to_string()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ReturnOrderRef {
            task_id: format!("RT-{}-{}", order.suborder_id, n),
            link: format!("https://return.example/{}", order.suborder_id),
        })
    }

    async fn query_return_status(&self, _task_id: &str) -> RecyclerResult<ReturnState> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().clone())
    }

    async fn schedule_return_plan(
        &self,
        order: &RecycleOrder,
        _hosts: &[RecycleHost],
    ) -> RecyclerResult<()> {
        self.plans.lock().insert(order.suborder_id.clone());
        Ok(())
    }
}

/// 固定结果的选主，可在测试中切换
#[derive(Default)]
pub struct FixedLeader {
    is_master: AtomicBool,
}

impl FixedLeader {
    pub fn new(is_master: bool) -> Self {
        Self {
            is_master: AtomicBool::new(is_master),
        }
    }

    pub fn set_master(&self, is_master: bool) {
        self.is_master.store(is_master, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaderElector for FixedLeader {
    async fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }
}

/// 按步骤计数的指标记录器，同时记下回收单流转
#[derive(Default)]
pub struct CountingMetrics {
    latencies: Mutex<HashMap<StepName, u32>>,
    errors: Mutex<HashMap<StepName, u32>>,
    retries: Mutex<HashMap<StepName, u32>>,
    wait_list_depths: Mutex<HashMap<StepName, usize>>,
    transitions: Mutex<Vec<(RecycleStatus, RecycleStatus)>>,
    recovered: Mutex<Vec<(RecycleStatus, bool)>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latency_count(&self, step: StepName) -> u32 {
        self.latencies.lock().get(&step).copied().unwrap_or(0)
    }

    pub fn error_count(&self, step: StepName) -> u32 {
        self.errors.lock().get(&step).copied().unwrap_or(0)
    }

    pub fn retry_count(&self, step: StepName) -> u32 {
        self.retries.lock().get(&step).copied().unwrap_or(0)
    }

    pub fn wait_list_depth(&self, step: StepName) -> Option<usize> {
        self.wait_list_depths.lock().get(&step).copied()
    }

    pub fn transitions(&self) -> Vec<(RecycleStatus, RecycleStatus)> {
        self.transitions.lock().clone()
    }

    pub fn recovered(&self) -> Vec<(RecycleStatus, bool)> {
        self.recovered.lock().clone()
    }
}

impl StepMetrics for CountingMetrics {
    fn record_step_latency(&self, step: StepName, _seconds: f64) {
        *self.latencies.lock().entry(step).or_insert(0) += 1;
    }

    fn record_step_error(&self, step: StepName) {
        *self.errors.lock().entry(step).or_insert(0) += 1;
    }

    fn record_step_retry(&self, step: StepName) {
        *self.retries.lock().entry(step).or_insert(0) += 1;
    }

    fn update_wait_list_depth(&self, step: StepName, depth: usize) {
        self.wait_list_depths.lock().insert(step, depth);
    }
}

impl OrderMetrics for CountingMetrics {
    fn record_order_transition(&self, from: RecycleStatus, to: RecycleStatus) {
        self.transitions.lock().push((from, to));
    }

    fn record_recovered_order(&self, status: RecycleStatus, success: bool) {
        self.recovered.lock().push((status, success));
    }
}
