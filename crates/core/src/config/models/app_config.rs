use std::path::Path;

use anyhow::{Context, Result};
use ::config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    DatabaseConfig, DetectorConfig, DispatcherConfig, EndpointsConfig, MetricsConfig, RecoveryConfig,
    ReturnerConfig, TransitConfig,
};
use crate::logging::LogConfig;
use crate::models::DetectStepCfg;

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecyclerConfig {
    pub log: LogConfig,
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub detector: DetectorConfig,
    pub recovery: RecoveryConfig,
    pub transit: TransitConfig,
    pub returner: ReturnerConfig,
    pub metrics: MetricsConfig,
    pub endpoints: EndpointsConfig,
    /// 启动时写入的检测步骤配置，已存在的同名配置会被覆盖
    pub steps: Vec<DetectStepCfg>,
}

impl RecyclerConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// * `config_path` - 配置文件路径，为None时依次尝试默认路径
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/recycler.toml",
                "recycler.toml",
                "/etc/recycler/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("RECYCLER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RecyclerConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: RecyclerConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.dispatcher
            .validate()
            .context("Dispatcher配置验证失败")?;
        self.detector.validate().context("检测配置验证失败")?;
        self.recovery.validate().context("恢复配置验证失败")?;
        self.returner.validate().context("退回配置验证失败")?;

        let mut seen = std::collections::HashSet::new();
        let mut sequences = std::collections::HashMap::new();
        for step in &self.steps {
            if !seen.insert(step.name) {
                return Err(anyhow::anyhow!("检测步骤 {} 重复配置", step.name));
            }
            // 步骤ID由任务ID和序号组成，序号重复会导致两类步骤写入同一条记录
            if let Some(other) = sequences.insert(step.sequence, step.name) {
                return Err(anyhow::anyhow!(
                    "检测步骤 {} 与 {} 的序号 {} 重复",
                    step.name,
                    other,
                    step.sequence
                ));
            }
            if step.batch_size == 0 {
                return Err(anyhow::anyhow!("检测步骤 {} 的batch_size必须大于0", step.name));
            }
            if step.worker_num == 0 {
                return Err(anyhow::anyhow!("检测步骤 {} 的worker_num必须大于0", step.name));
            }
            if step.rate_limit_qps <= 0.0 || step.rate_limit_burst == 0 {
                return Err(anyhow::anyhow!("检测步骤 {} 的限流参数无效", step.name));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepName;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RecyclerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_toml_with_steps() {
        let toml_str = r#"
            [dispatcher]
            max_concurrent_orders = 3

            [[steps]]
            name = "PreCheck"
            sequence = 1

            [[steps]]
            name = "BasicCheck"
            sequence = 2
            retry = 2
            retry_interval_sec = 5
        "#;
        let config = RecyclerConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.dispatcher.max_concurrent_orders, 3);
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[1].name, StepName::BasicCheck);
        assert_eq!(config.steps[1].retry, 2);
        assert!(config.steps[0].enable);
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config =
            RecyclerConfig::from_toml(include_str!("../../../../../config/recycler.toml")).unwrap();
        assert_eq!(config.steps[0].name, StepName::PreCheck);
        assert_eq!(config.dispatcher.requeue_delay_seconds, 60);
        assert!(config.steps.iter().all(|s| s.enable));
        assert!(config.database.url.starts_with("sqlite:"));
    }

    #[test]
    fn test_duplicate_steps_rejected() {
        let toml_str = r#"
            [[steps]]
            name = "PreCheck"
            sequence = 1

            [[steps]]
            name = "PreCheck"
            sequence = 2
        "#;
        assert!(RecyclerConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let toml_str = r#"
            [[steps]]
            name = "PreCheck"
            sequence = 1

            [[steps]]
            name = "BasicCheck"
            sequence = 1
        "#;
        let err = RecyclerConfig::from_toml(toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("序号 1 重复"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recycler.toml");
        std::fs::write(&path, "[recovery]\nmin_stay_minutes = 1\n").unwrap();
        let config = RecyclerConfig::load(path.to_str()).unwrap();
        assert_eq!(config.recovery.min_stay_minutes, 1);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(RecyclerConfig::load(Some("/nonexistent/recycler.toml")).is_err());
    }
}
