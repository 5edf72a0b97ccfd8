//! 转移阶段：把主机转入资源回收业务下的待回收模块
//!
//! 转移是幂等的：已经位于目标模块或回收业务下任一待回收模块的主机直接跳过，
//! 因此进程重启后可以整体重做。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use recycler_core::models::{
    HostFilter, HostUpdate, RecycleHost, RecycleOrder, RecycleStatus, RecycleType, ResourceType,
};
use recycler_core::{CmdbClient, RecyclerError, RecyclerResult, Repositories, TransitConfig};

/// 转移阶段接口
#[async_trait]
pub trait TransitPhase: Send + Sync {
    async fn transit(&self, order: &RecycleOrder) -> RecyclerResult<()>;

    /// 中断后继续转移
    async fn resume(&self, order: &RecycleOrder) -> RecyclerResult<()> {
        self.transit(order).await
    }
}

/// 基于CMDB的主机转移
pub struct CmdbTransit {
    repos: Repositories,
    cmdb: Arc<dyn CmdbClient>,
    config: TransitConfig,
}

impl CmdbTransit {
    pub fn new(
        repos: Repositories,
        cmdb: Arc<dyn CmdbClient>,
        config: Option<TransitConfig>,
    ) -> Self {
        Self {
            repos,
            cmdb,
            config: config.unwrap_or_default(),
        }
    }

    /// 回收单对应的目标模块
    pub fn target_module(&self, order: &RecycleOrder) -> i64 {
        match (order.resource_type, order.recycle_type) {
            (ResourceType::Cvm, _) => self.config.cvm_module_id,
            (ResourceType::IdcPm, RecycleType::Dissolve | RecycleType::Expired) => {
                self.config.dissolve_module_id
            }
            _ => self.config.pm_module_id,
        }
    }

    async fn is_recycle_module(
        &self,
        cache: &mut HashMap<i64, bool>,
        module_id: i64,
    ) -> RecyclerResult<bool> {
        if let Some(&known) = cache.get(&module_id) {
            return Ok(known);
        }
        let is_recycle = self
            .cmdb
            .get_module(self.config.recycle_biz_id, module_id)
            .await?
            .map(|m| m.is_recycle)
            .unwrap_or(false);
        cache.insert(module_id, is_recycle);
        Ok(is_recycle)
    }

    async fn hosts_to_transit(&self, suborder_id: &str) -> RecyclerResult<Vec<RecycleHost>> {
        Ok(self
            .repos
            .hosts
            .find(&HostFilter::by_suborder(suborder_id))
            .await?
            .into_iter()
            .filter(|h| h.status != RecycleStatus::DetectFailed && !h.status.is_terminal())
            .collect())
    }
}

#[async_trait]
impl TransitPhase for CmdbTransit {
    async fn transit(&self, order: &RecycleOrder) -> RecyclerResult<()> {
        let suborder_id = order.suborder_id.as_str();
        let hosts = self.hosts_to_transit(suborder_id).await?;
        if hosts.is_empty() {
            info!(suborder_id = suborder_id, "没有需要转移的主机");
            return Ok(());
        }

        let host_ids: Vec<i64> = hosts.iter().map(|h| h.host_id).collect();
        self.repos
            .hosts
            .update(
                &HostFilter::by_suborder(suborder_id).with_host_ids(host_ids.clone()),
                &HostUpdate::status(RecycleStatus::Transiting),
            )
            .await?;

        let topo: HashMap<i64, _> = self
            .cmdb
            .get_host_topo(&host_ids)
            .await?
            .into_iter()
            .map(|t| (t.host_id, t))
            .collect();

        let target = self.target_module(order);
        let recycle_biz = self.config.recycle_biz_id;
        let mut module_cache = HashMap::new();
        let mut by_biz: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        let mut skipped = 0usize;

        for host_id in &host_ids {
            let Some(t) = topo.get(host_id) else {
                return Err(RecyclerError::ExternalApi(format!(
                    "主机 {host_id} 在CMDB中不存在"
                )));
            };
            if t.bk_biz_id == recycle_biz
                && (t.bk_module_id == target
                    || self.is_recycle_module(&mut module_cache, t.bk_module_id).await?)
            {
                skipped += 1;
                continue;
            }
            by_biz.entry(t.bk_biz_id).or_default().push(*host_id);
        }

        for (from_biz, ids) in &by_biz {
            debug!(
                suborder_id = suborder_id,
                from_biz = from_biz,
                count = ids.len(),
                "转移主机到待回收模块"
            );
            self.cmdb
                .transfer_hosts(ids, *from_biz, recycle_biz, target)
                .await?;
        }

        info!(
            suborder_id = suborder_id,
            transferred = host_ids.len() - skipped,
            skipped = skipped,
            module = target,
            "主机转移完成"
        );
        Ok(())
    }
}
