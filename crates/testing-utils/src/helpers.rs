//! 测试环境初始化与常用等待逻辑

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use recycler_core::models::{DetectStepCfg, RecycleHost, RecycleOrder};
use recycler_core::{RecyclerResult, Repositories};
use recycler_infrastructure::MemoryStore;

use crate::builders::HostBuilder;

pub struct TestEnv;

impl TestEnv {
    /// 轮询等待条件成立，基于 `tokio::time`，暂停时钟下同样可用
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition().await
    }

    /// 测试用的关闭信号，发送端需要在测试期间保持存活
    pub fn shutdown_channel() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
        broadcast::channel(1)
    }

    /// 初始化测试日志（每个测试二进制调用一次即可）
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

/// 基于内存存储的测试仓储
#[derive(Clone)]
pub struct TestStore {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStore {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let repos = store.repositories();
        Self { store, repos }
    }

    pub async fn seed_step_cfgs(&self, cfgs: &[DetectStepCfg]) -> RecyclerResult<()> {
        for cfg in cfgs {
            self.repos.step_cfgs.upsert(cfg).await?;
        }
        Ok(())
    }

    /// 写入回收单和 `host_count` 台主机，主机ID从1001开始
    pub async fn seed_order(
        &self,
        order: &RecycleOrder,
        host_count: usize,
    ) -> RecyclerResult<Vec<RecycleHost>> {
        self.repos.orders.create(order).await?;
        let hosts: Vec<RecycleHost> = (0..host_count)
            .map(|i| HostBuilder::for_order(order, 1001 + i as i64).build())
            .collect();
        if !hosts.is_empty() {
            self.repos.hosts.create_many(&hosts).await?;
        }
        Ok(hosts)
    }

    pub async fn order(&self, suborder_id: &str) -> Option<RecycleOrder> {
        self.repos.orders.get(suborder_id).await.ok().flatten()
    }
}
