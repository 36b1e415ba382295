use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::configs::RegistryConfig;
use crate::service_register_center::typos::{HealthCheck, Service, META_WEIGHT};
use crate::service_register_center::ServiceRegister;
use crate::Error;

/// Consul client configuration options
#[derive(Debug, Clone)]
pub struct ConsulOptions {
    /// 主地址，例如 `http://127.0.0.1:8500`
    pub address: String,
    /// 主地址传输失败时改用的地址
    pub secondary_address: Option<String>,
    pub timeout: Duration,
}

impl ConsulOptions {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            address: config.address.trim_end_matches('/').to_string(),
            secondary_address: config
                .secondary_address
                .as_ref()
                .map(|addr| addr.trim_end_matches('/').to_string()),
            timeout: config.timeout(),
        }
    }
}

/// Consul service registry implementation
///
/// 直接使用 agent HTTP API，只读取 passing 状态的实例
#[derive(Debug)]
pub struct Consul {
    pub options: ConsulOptions,
    client: Client,
}

/// `/v1/health/service/{name}` 返回的单个条目
#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node", default)]
    node: Option<NodeEntry>,
    #[serde(rename = "Service")]
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
    #[serde(rename = "Weights", default)]
    weights: Option<WeightsEntry>,
}

#[derive(Debug, Deserialize)]
struct WeightsEntry {
    #[serde(rename = "Passing", default)]
    passing: i32,
}

impl Consul {
    /// Create a new Consul client from registry config
    pub fn from_config(config: &RegistryConfig) -> Result<Self, Error> {
        let options = ConsulOptions::from_config(config);
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::Config(format!("创建 Consul 客户端失败: {}", e)))?;
        Ok(Self { options, client })
    }

    fn check_payload(service: &Service, check: &HealthCheck) -> Value {
        let mut payload = json!({
            "Name": check.name,
            "Interval": check.interval,
            "Timeout": check.timeout,
        });
        if !check.deregister_after.is_empty() {
            payload["DeregisterCriticalServiceAfter"] = json!(check.deregister_after);
        }
        if let Some(http) = &check.http {
            // 相对路径拼接到实例地址上
            let url = if http.starts_with("http://") || http.starts_with("https://") {
                http.clone()
            } else {
                format!("http://{}{}", service.address(), http)
            };
            payload["HTTP"] = json!(url);
            if let Some(method) = &check.method {
                payload["Method"] = json!(method);
            }
            if !check.headers.is_empty() {
                payload["Header"] = json!(check.headers);
            }
        } else {
            let target = check.tcp.clone().unwrap_or_else(|| service.address());
            payload["TCP"] = json!(target);
        }
        payload
    }

    fn register_payload(service: &Service) -> Value {
        let mut payload = json!({
            "ID": service.id(),
            "Name": service.name,
            "Address": service.ip,
            "Port": service.port,
            "Tags": service.tags,
            "Meta": service.meta,
            "Weights": { "Passing": service.weight, "Warning": 1 },
        });
        if let Some(check) = &service.check {
            payload["Check"] = Self::check_payload(service, check);
        }
        payload
    }

    async fn error_from_response(response: Response) -> Error {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Error::Registry(format!("HTTP {}: {}", status, error_text))
    }

    async fn fetch_health(
        &self,
        address: &str,
        name: &str,
        dc: &str,
        tags: &[String],
    ) -> Result<Response, reqwest::Error> {
        let url = format!("{}/v1/health/service/{}", address, name);
        let mut query: Vec<(&str, &str)> = vec![("passing", "true")];
        if !dc.is_empty() {
            query.push(("dc", dc));
        }
        for tag in tags {
            query.push(("tag", tag.as_str()));
        }
        self.client.get(url).query(&query).send().await
    }
}

#[async_trait]
impl ServiceRegister for Consul {
    async fn register(&self, service: &Service) -> Result<String, Error> {
        service.validate()?;
        let url = format!("{}/v1/agent/service/register", self.options.address);

        debug!(
            "Registering service: {} ({}:{})",
            service.name, service.ip, service.port
        );

        let payload = Self::register_payload(service);
        let response = self.client.put(&url).json(&payload).send().await?;

        if response.status().is_success() {
            info!("Service registered successfully: {}", service.id());
            Ok(service.id().to_string())
        } else {
            let err = Self::error_from_response(response).await;
            error!("Failed to register service {}: {}", service.name, err);
            Err(err)
        }
    }

    async fn deregister(&self, service_id: &str) -> Result<(), Error> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.options.address, service_id
        );

        debug!("Deregistering service: {}", service_id);

        let response = self.client.put(&url).send().await?;

        if response.status().is_success() {
            info!("Service deregistered successfully: {}", service_id);
            Ok(())
        } else {
            let err = Self::error_from_response(response).await;
            error!("Failed to deregister service {}: {}", service_id, err);
            Err(err)
        }
    }

    async fn lookup(&self, name: &str, dc: &str, tags: &[String]) -> Result<Vec<Service>, Error> {
        debug!("Finding healthy services with name: {}", name);

        let response = match self.fetch_health(&self.options.address, name, dc, tags).await {
            Ok(response) => response,
            Err(e) => match &self.options.secondary_address {
                Some(secondary) => {
                    warn!(
                        "Primary discovery address failed ({}), retrying on {}",
                        e, secondary
                    );
                    self.fetch_health(secondary, name, dc, tags).await?
                }
                None => return Err(e.into()),
            },
        };

        if !response.status().is_success() {
            let err = Self::error_from_response(response).await;
            error!("Failed to find services: {}", err);
            return Err(err);
        }

        let entries: Vec<HealthEntry> = response.json().await?;

        let services: Vec<Service> = entries
            .into_iter()
            .map(|entry| {
                // 从Service中获取地址，如果不存在则尝试从Node中获取
                let address = if entry.service.address.is_empty() {
                    entry.node.map(|n| n.address).unwrap_or_default()
                } else {
                    entry.service.address
                };
                let meta = entry.service.meta.unwrap_or_default();
                let weight = entry
                    .service
                    .weights
                    .map(|w| w.passing)
                    .filter(|w| *w > 0)
                    .or_else(|| meta.get(META_WEIGHT).and_then(|w| w.parse().ok()))
                    .unwrap_or(crate::service_register_center::typos::DEFAULT_WEIGHT);

                let mut service = Service::new(entry.service.service, address, entry.service.port)
                    .with_id(entry.service.id)
                    .with_tags(entry.service.tags.unwrap_or_default());
                service.meta = meta;
                service.weight = weight;
                service
            })
            .collect();

        if services.is_empty() {
            debug!("No healthy services found with name: {}", name);
            return Err(Error::NotFound(name.to_string()));
        }

        info!("Found {} healthy instances of service: {}", services.len(), name);
        Ok(services)
    }
}
