use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use common::invocation::Invocation;
use common::{Error, Result};

/// 传输层返回的响应
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// 传输层
///
/// 实现方把连接失败报告为 `Unavailable`，把超时报告为 `Timeout`，编排器据此决定重试和屏蔽
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn call(&self, endpoint: &str, inv: &Invocation) -> Result<Response>;
}

/// HTTP 传输：把调用体 POST 到 `http://{endpoint}/{operation}`，元数据作为请求头
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().pool_max_idle_per_host(100);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("HTTP 客户端创建失败: {}", e)))?;
        Ok(Self { client })
    }

    pub fn url(endpoint: &str, operation: &str) -> String {
        let endpoint = endpoint
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("http://{}/{}", endpoint, operation.trim_start_matches('/'))
    }
}

/// reqwest 错误归类：超时、连接和收发失败交给重试，其余是调用方自身的问题
fn transport_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", url, err))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        Error::Unavailable(format!("{}: {}", url, err))
    } else if err.is_decode() {
        Error::Json(format!("{}: {}", url, err))
    } else {
        Error::Internal(format!("{} 请求失败: {}", url, err))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, endpoint: &str, inv: &Invocation) -> Result<Response> {
        let url = Self::url(endpoint, &inv.operation);
        debug!("转发调用: {} -> {}", inv.microservice_name, url);

        let mut request = self.client.post(&url).body(inv.body.clone());
        for (key, value) in &inv.metadata {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| transport_error(&url, e))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&url, e))?
            .to_vec();

        // 5xx 视为实例不可用，交给重试逻辑处理
        if status.is_server_error() {
            return Err(Error::Unavailable(format!("{} 返回 {}", url, status.as_u16())));
        }
        Ok(Response {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[test]
    fn url_joins_endpoint_and_operation() {
        assert_eq!(HttpTransport::url("10.0.0.1:80", "/users/1"), "http://10.0.0.1:80/users/1");
        assert_eq!(HttpTransport::url("http://api.local/", "users"), "http://api.local/users");
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Some(Duration::from_secs(2))).unwrap();
        let err = transport
            .call(&addr.to_string(), &Invocation::new("user", "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn silent_peer_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // 接受连接但从不回应
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let transport = HttpTransport::new(Some(Duration::from_millis(200))).unwrap();
        let err = transport
            .call(&addr.to_string(), &Invocation::new("user", "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
        server.abort();
    }

    #[tokio::test]
    async fn malformed_endpoint_is_internal_not_registry() {
        let transport = HttpTransport::new(None).unwrap();
        let err = transport
            .call("bad host:80", &Invocation::new("user", "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "{:?}", err);
        assert!(!err.is_retryable());
    }
}
