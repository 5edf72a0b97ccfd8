use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use recycler_core::models::StepName;
use recycler_core::{OrderMetrics, RecyclerConfig, Repositories, StepChecker, StepMetrics};
use recycler_detector::{Detector, ExecutorRegistry, PreChecker};
use recycler_dispatcher::{CmdbTransit, Dispatcher, ProviderReturner, SystemRecoveryService};
use recycler_infrastructure::{
    open_repositories, HttpCmdbClient, HttpReturnProvider, HttpStepChecker, MetricsCollector,
    StandaloneElector,
};

/// 外部检测接口单批次允许的最大主机数
const HTTP_CHECKER_MAX_BATCH: usize = 200;

/// 主应用程序
pub struct Application {
    config: RecyclerConfig,
    repos: Repositories,
}

impl Application {
    pub async fn new(config: RecyclerConfig) -> Result<Self> {
        if let Some(listen) = &config.metrics.prometheus_listen {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("无效的指标监听地址: {listen}"))?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("启动Prometheus指标服务失败")?;
            info!("Prometheus指标服务监听于 {}", addr);
        }

        let repos = open_repositories(&config.database)
            .await
            .context("打开数据库失败")?;
        for cfg in &config.steps {
            repos
                .step_cfgs
                .upsert(cfg)
                .await
                .with_context(|| format!("写入检测步骤配置 {} 失败", cfg.name))?;
        }

        Ok(Self { config, repos })
    }

    fn build_checkers(&self) -> Result<HashMap<StepName, Arc<dyn StepChecker>>> {
        let mut checkers: HashMap<StepName, Arc<dyn StepChecker>> = HashMap::new();
        for step in StepName::ALL {
            let checker: Arc<dyn StepChecker> = match step {
                StepName::PreCheck => Arc::new(PreChecker::default()),
                _ => Arc::new(
                    HttpStepChecker::new(step, &self.config.endpoints, HTTP_CHECKER_MAX_BATCH)
                        .with_context(|| format!("创建检测项 {step} 的客户端失败"))?,
                ),
            };
            checkers.insert(step, checker);
        }
        Ok(checkers)
    }

    /// 启动全部后台组件，收到关闭信号后返回
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let cfgs = self.repos.step_cfgs.list().await?;
        if cfgs.iter().all(|cfg| !cfg.enable) {
            warn!("没有启用的检测步骤，所有主机将直接通过检测");
        }

        let checkers = self.build_checkers()?;
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(
            ExecutorRegistry::build(
                &cfgs,
                &checkers,
                self.repos.detect_steps.clone(),
                metrics.clone() as Arc<dyn StepMetrics>,
                &self.config.detector,
            )
            .context("创建检测执行器失败")?,
        );
        let mut handles: Vec<JoinHandle<()>> = registry.start(&shutdown_rx);
        info!("检测执行器已启动: {:?}", registry.step_names());

        let detector = Arc::new(Detector::new(
            self.repos.clone(),
            registry,
            Some(self.config.detector.clone()),
        ));
        let cmdb = Arc::new(HttpCmdbClient::new(&self.config.endpoints)?);
        let provider = Arc::new(HttpReturnProvider::new(&self.config.endpoints)?);
        let transit = Arc::new(CmdbTransit::new(
            self.repos.clone(),
            cmdb,
            Some(self.config.transit.clone()),
        ));
        let returner = Arc::new(ProviderReturner::new(
            self.repos.clone(),
            provider,
            Some(self.config.returner.clone()),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            self.repos.clone(),
            detector,
            transit,
            returner,
            metrics as Arc<dyn OrderMetrics>,
            Some(self.config.dispatcher.clone()),
        )?);
        handles.push(dispatcher.clone().start(shutdown_rx.resubscribe()));

        let recovery = Arc::new(SystemRecoveryService::new(
            self.repos.clone(),
            dispatcher,
            Arc::new(StandaloneElector::default()),
            Some(self.config.recovery.clone()),
        ));
        handles.push(recovery.start(shutdown_rx.resubscribe()));

        info!("资源回收服务已启动");
        let _ = shutdown_rx.recv().await;

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("后台任务退出异常: {}", e);
            }
        }
        info!("资源回收服务已停止");
        Ok(())
    }
}
