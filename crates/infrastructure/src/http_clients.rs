//! 外部系统的HTTP适配器
//!
//! 外部接口统一返回 `{"code": 0, "message": "", "data": ...}` 信封，`code` 非0表示
//! 业务失败。

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use recycler_core::models::{RecycleHost, RecycleOrder, StepName};
use recycler_core::{
    CheckReport, CheckTarget, CmdbClient, EndpointsConfig, HostTopo, ModuleInfo,
    RecyclerError, RecyclerResult, ReturnOrderRef, ReturnProvider, ReturnState, StepChecker,
};

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

fn build_client(timeout_seconds: u64) -> RecyclerResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| RecyclerError::Configuration(format!("HTTP客户端创建失败: {e}")))
}

/// 发送请求并解析信封，`Ok(None)` 表示对端返回404
async fn send_envelope<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> RecyclerResult<Option<T>> {
    let response = request
        .send()
        .await
        .map_err(|e| RecyclerError::ExternalApi(format!("请求发送失败: {e}")))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RecyclerError::ExternalApi(format!("HTTP {status} - {body}")));
    }

    let envelope: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| RecyclerError::ExternalApi(format!("响应解析失败: {e}")))?;
    if envelope.code != 0 {
        return Err(RecyclerError::ExternalApi(format!(
            "业务错误 code={}: {}",
            envelope.code, envelope.message
        )));
    }
    Ok(envelope.data)
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    passed: bool,
    #[serde(default)]
    log: String,
    #[serde(default)]
    reason: String,
}

/// 通过HTTP调用单个检测项
pub struct HttpStepChecker {
    step_name: StepName,
    url: String,
    max_batch_size: usize,
    http_client: reqwest::Client,
}

impl HttpStepChecker {
    pub fn new(
        step_name: StepName,
        endpoints: &EndpointsConfig,
        max_batch_size: usize,
    ) -> RecyclerResult<Self> {
        Ok(Self {
            step_name,
            url: format!("{}/{}", endpoints.checker_base, step_name.as_str()),
            max_batch_size,
            http_client: build_client(endpoints.request_timeout_seconds)?,
        })
    }
}

#[async_trait]
impl StepChecker for HttpStepChecker {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn check(&self, target: &CheckTarget) -> CheckReport {
        let response = match self.http_client.post(&self.url).json(target).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(step = %self.step_name, ip = %target.ip, "检测接口调用失败: {}", e);
                return CheckReport::transient(format!("检测接口调用失败: {e}"));
            }
        };

        let status = response.status();
        if status.is_server_error() {
            return CheckReport::transient(format!("检测接口返回 HTTP {status}"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return CheckReport::rejected(format!("检测接口返回 HTTP {status}"), body);
        }

        match response.json::<ApiResponse<CheckResponse>>().await {
            Ok(ApiResponse {
                code: 0,
                data: Some(data),
                ..
            }) => {
                debug!(step = %self.step_name, ip = %target.ip, passed = data.passed, "检测完成");
                if data.passed {
                    CheckReport::success(data.log)
                } else {
                    CheckReport::rejected(data.reason, data.log)
                }
            }
            Ok(envelope) => CheckReport::rejected(
                format!("检测接口业务错误 code={}: {}", envelope.code, envelope.message),
                String::new(),
            ),
            Err(e) => CheckReport::transient(format!("检测结果解析失败: {e}")),
        }
    }
}

/// CMDB的HTTP客户端
pub struct HttpCmdbClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpCmdbClient {
    pub fn new(endpoints: &EndpointsConfig) -> RecyclerResult<Self> {
        Ok(Self {
            base_url: endpoints.cmdb_base.clone(),
            http_client: build_client(endpoints.request_timeout_seconds)?,
        })
    }
}

#[async_trait]
impl CmdbClient for HttpCmdbClient {
    async fn get_host_topo(&self, host_ids: &[i64]) -> RecyclerResult<Vec<HostTopo>> {
        let url = format!("{}/hosts/topo", self.base_url);
        let request = self.http_client.post(&url).json(&json!({ "host_ids": host_ids }));
        Ok(send_envelope::<Vec<HostTopo>>(request)
            .await?
            .unwrap_or_default())
    }

    async fn get_module(
        &self,
        bk_biz_id: i64,
        bk_module_id: i64,
    ) -> RecyclerResult<Option<ModuleInfo>> {
        let url = format!("{}/biz/{}/modules/{}", self.base_url, bk_biz_id, bk_module_id);
        send_envelope::<ModuleInfo>(self.http_client.get(&url)).await
    }

    async fn transfer_hosts(
        &self,
        host_ids: &[i64],
        from_biz_id: i64,
        to_biz_id: i64,
        to_module_id: i64,
    ) -> RecyclerResult<()> {
        let url = format!("{}/hosts/transfer", self.base_url);
        let request = self.http_client.post(&url).json(&json!({
            "host_ids": host_ids,
            "from_biz_id": from_biz_id,
            "to_biz_id": to_biz_id,
            "to_module_id": to_module_id,
        }));
        send_envelope::<serde_json::Value>(request).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ReturnOrderRequest<'a> {
    suborder_id: &'a str,
    bk_biz_id: i64,
    resource_type: recycler_core::models::ResourceType,
    asset_ids: Vec<&'a str>,
}

impl<'a> ReturnOrderRequest<'a> {
    fn new(order: &'a RecycleOrder, hosts: &'a [RecycleHost]) -> Self {
        Self {
            suborder_id: &order.suborder_id,
            bk_biz_id: order.bk_biz_id,
            resource_type: order.resource_type,
            asset_ids: hosts.iter().map(|h| h.asset_id.as_str()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReturnStatusResponse {
    status: String,
    #[serde(default)]
    message: String,
}

/// 资源退回平台的HTTP客户端
pub struct HttpReturnProvider {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpReturnProvider {
    pub fn new(endpoints: &EndpointsConfig) -> RecyclerResult<Self> {
        Ok(Self {
            base_url: endpoints.return_base.clone(),
            http_client: build_client(endpoints.request_timeout_seconds)?,
        })
    }
}

#[async_trait]
impl ReturnProvider for HttpReturnProvider {
    async fn create_return_order(
        &self,
        order: &RecycleOrder,
        hosts: &[RecycleHost],
    ) -> RecyclerResult<ReturnOrderRef> {
        let url = format!("{}/orders", self.base_url);
        let request = self
            .http_client
            .post(&url)
            .json(&ReturnOrderRequest::new(order, hosts));
        send_envelope::<ReturnOrderRef>(request)
            .await?
            .ok_or_else(|| RecyclerError::ExternalApi("退回单创建接口未返回单号".to_string()))
    }

    async fn query_return_status(&self, task_id: &str) -> RecyclerResult<ReturnState> {
        let url = format!("{}/orders/{}", self.base_url, task_id);
        let data = send_envelope::<ReturnStatusResponse>(self.http_client.get(&url))
            .await?
            .ok_or_else(|| RecyclerError::ExternalApi(format!("退回单不存在: {task_id}")))?;
        Ok(parse_return_state(&data.status, data.message))
    }

    async fn schedule_return_plan(
        &self,
        order: &RecycleOrder,
        hosts: &[RecycleHost],
    ) -> RecyclerResult<()> {
        let url = format!("{}/plans", self.base_url);
        let request = self
            .http_client
            .put(&url)
            .json(&ReturnOrderRequest::new(order, hosts));
        send_envelope::<serde_json::Value>(request).await?;
        Ok(())
    }
}

fn parse_return_state(status: &str, message: String) -> ReturnState {
    match status {
        "SUCCESS" | "DONE" => ReturnState::Success,
        "FAILED" | "REJECTED" => ReturnState::Failed(message),
        _ => ReturnState::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_return_state() {
        assert_eq!(parse_return_state("DONE", String::new()), ReturnState::Success);
        assert_eq!(
            parse_return_state("FAILED", "库存不足".to_string()),
            ReturnState::Failed("库存不足".to_string())
        );
        assert_eq!(parse_return_state("AUDITING", String::new()), ReturnState::Running);
    }

    #[test]
    fn test_checker_url_per_step() {
        let endpoints = EndpointsConfig::default();
        let checker = HttpStepChecker::new(StepName::CheckUwork, &endpoints, 20).unwrap();
        assert!(checker.url.ends_with("/CheckUwork"));
        assert_eq!(checker.max_batch_size(), 20);
    }

    #[test]
    fn test_envelope_decoding() {
        let raw = r#"{"code":0,"message":"","data":{"passed":false,"reason":"有未完结故障单"}}"#;
        let envelope: ApiResponse<CheckResponse> = serde_json::from_str(raw).unwrap();
        let data = envelope.data.unwrap();
        assert!(!data.passed);
        assert_eq!(data.reason, "有未完结故障单");
    }
}
