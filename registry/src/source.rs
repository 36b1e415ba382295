use std::fmt::Debug;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use common::configs::SelfProtectionConfig;
use common::service_register_center::typos::{Service, ServiceKey};
use common::{Error, Result};

/// 快照源的一次应答
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// 为 true 时该键进入降级状态
    pub use_sentinel: bool,
    /// 降级时使用的实例列表，可以为空
    pub services: Vec<Service>,
}

/// 自我保护的快照源
#[async_trait]
pub trait SnapshotSource: Send + Sync + Debug {
    async fn fetch(&self, key: &ServiceKey) -> Result<SourceSnapshot>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    use_sentinel: bool,
    #[serde(default)]
    data: Vec<Service>,
}

/// HTTP 快照源
///
/// GET `{address}{path}?dc=..&tag=..&tag=..`，路径中的 `{service}` 替换为服务名
#[derive(Debug)]
pub struct HttpSnapshotSource {
    client: Client,
    address: String,
    path: String,
}

impl HttpSnapshotSource {
    pub fn from_config(config: &SelfProtectionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("创建快照源客户端失败: {}", e)))?;
        Ok(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            path: config.path.clone(),
        })
    }

    fn url_for(&self, key: &ServiceKey) -> String {
        format!("{}{}", self.address, self.path.replace("{service}", &key.origin_name))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, key: &ServiceKey) -> Result<SourceSnapshot> {
        let url = self.url_for(key);
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(key.tags.len() + 1);
        if !key.dc.is_empty() {
            query.push(("dc", key.dc.as_str()));
        }
        for tag in &key.tags {
            query.push(("tag", tag.as_str()));
        }

        let response = self.client.get(&url).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "快照源返回 HTTP {}: {}",
                response.status(),
                url
            )));
        }

        let envelope: Envelope = response.json().await?;
        if envelope.code != 0 {
            return Err(Error::Registry(format!(
                "快照源错误 {}: {}",
                envelope.code, envelope.message
            )));
        }

        let snapshot = envelope
            .data
            .map(|data| SourceSnapshot {
                use_sentinel: data.use_sentinel,
                services: data.data,
            })
            .unwrap_or_default();
        debug!(
            "Fetched snapshot for {}: use_sentinel={}, {} instances",
            key,
            snapshot.use_sentinel,
            snapshot.services.len()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, RawQuery, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Queries = Arc<Mutex<Vec<String>>>;

    async fn sentinel(
        State(queries): State<Queries>,
        Path(service): Path<String>,
        RawQuery(query): RawQuery,
    ) -> Json<Value> {
        queries.lock().unwrap().push(query.unwrap_or_default());
        match service.as_str() {
            "user" => Json(json!({
                "code": 0,
                "message": "ok",
                "data": {
                    "use_sentinel": true,
                    "data": [{ "name": "user-http", "ip": "10.0.0.5", "port": 8080 }]
                }
            })),
            "broken" => Json(json!({ "code": 500, "message": "boom" })),
            _ => Json(json!({ "code": 0, "message": "ok", "data": { "use_sentinel": false, "data": [] } })),
        }
    }

    async fn spawn_source() -> (String, Queries) {
        let queries = Queries::default();
        let app = Router::new()
            .route("/v1/sentinel/{service}", get(sentinel))
            .with_state(queries.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), queries)
    }

    fn source(address: &str) -> HttpSnapshotSource {
        HttpSnapshotSource::from_config(&SelfProtectionConfig {
            address: address.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn parses_envelope() {
        let (address, _) = spawn_source().await;
        let source = source(&address);

        let snapshot = source.fetch(&ServiceKey::new("user", "http", "")).await.unwrap();
        assert!(snapshot.use_sentinel);
        assert_eq!(snapshot.services[0].address(), "10.0.0.5:8080");
        assert_eq!(snapshot.services[0].weight, 100);

        let calm = source.fetch(&ServiceKey::new("order", "http", "")).await.unwrap();
        assert_eq!(calm, SourceSnapshot::default());

        let err = source.fetch(&ServiceKey::new("broken", "http", "")).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
    }

    #[tokio::test]
    async fn sends_dc_and_repeated_tags() {
        let (address, queries) = spawn_source().await;
        let source = source(&address);
        let key = ServiceKey::new("user", "http", "")
            .with_dc("dc1")
            .with_tags(["b=2", "a=1"]);

        assert_eq!(source.url_for(&key), format!("{}/v1/sentinel/user", address));
        source.fetch(&key).await.unwrap();
        assert_eq!(
            queries.lock().unwrap().as_slice(),
            &["dc=dc1&tag=a%3D1&tag=b%3D2".to_string()]
        );
    }
}
