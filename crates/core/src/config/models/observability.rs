use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus抓取地址，例如 `0.0.0.0:9100`，为空时不暴露
    pub prometheus_listen: Option<String>,
}

/// 外部系统地址
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// 检测接口基础地址，各检测项的路径为 `{checker_base}/{step_name}`
    pub checker_base: String,
    pub cmdb_base: String,
    pub return_base: String,
    pub request_timeout_seconds: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            checker_base: "http://127.0.0.1:8080/api/v1/check".to_string(),
            cmdb_base: "http://127.0.0.1:8080/api/v1/cmdb".to_string(),
            return_base: "http://127.0.0.1:8080/api/v1/return".to_string(),
            request_timeout_seconds: 30,
        }
    }
}
