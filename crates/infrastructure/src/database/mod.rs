//! 持久化存储
//!
//! 生产部署使用SQLite文件库，进程重启后由恢复服务从库中重建内存状态。

mod sqlite_store;

use std::sync::Arc;

use tracing::{info, warn};

use recycler_core::{DatabaseConfig, RecyclerResult, Repositories};

use crate::memory_store::MemoryStore;

pub use sqlite_store::SqliteStore;

/// 按配置打开存储并返回全部仓储
pub async fn open_repositories(config: &DatabaseConfig) -> RecyclerResult<Repositories> {
    if config.is_memory() {
        warn!("使用进程内存储，重启后回收单数据将丢失");
        return Ok(Arc::new(MemoryStore::new()).repositories());
    }

    let store = Arc::new(SqliteStore::connect(config).await?);
    info!("已连接数据库: {}", config.url);
    Ok(store.repositories())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recycler_core::models::{RecycleOrder, RecycleType, ResourceType, ReturnPlan};

    #[tokio::test]
    async fn test_open_by_url() {
        let memory = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let repos = open_repositories(&memory).await.unwrap();
        assert_eq!(repos.step_cfgs.list().await.unwrap().len(), 0);

        let dir = tempfile::tempdir().unwrap();
        let sqlite = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("open.db").display()),
            ..Default::default()
        };
        let order = RecycleOrder::new(
            "1-1",
            1,
            100,
            ResourceType::Cvm,
            RecycleType::Regular,
            ReturnPlan::Immediate,
        );
        open_repositories(&sqlite)
            .await
            .unwrap()
            .orders
            .create(&order)
            .await
            .unwrap();
        let reopened = open_repositories(&sqlite).await.unwrap();
        assert!(reopened.orders.get("1-1").await.unwrap().is_some());
    }
}
