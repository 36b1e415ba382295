use std::collections::BTreeMap;
use std::time::Duration;

use crate::service_register_center::typos::ServiceKey;

/// 一次出站调用的上下文
///
/// 可以放进对象池复用，`reset` 之后与新建的实例完全相同
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// 目标服务名，含 "." 时视为直连主机
    pub microservice_name: String,
    /// 调用方服务名
    pub source_service: String,
    pub protocol: String,
    /// 操作名，HTTP 传输下作为请求路径
    pub operation: String,
    /// 显式指定的直连地址，设置后跳过服务发现
    pub endpoint: Option<String>,
    /// 路由标签，参与服务解析
    pub route_tags: BTreeMap<String, String>,
    /// 透传给传输层的元数据
    pub metadata: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// 覆盖配置中的负载均衡策略
    pub strategy: Option<String>,
    /// 会话粘滞使用的会话ID
    pub session_id: Option<String>,
    /// 本次调用的超时
    pub timeout: Option<Duration>,
    pub dc: String,
}

impl Invocation {
    pub fn new(microservice_name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            microservice_name: microservice_name.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_route_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.route_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 清空所有字段，包括路由标签和元数据
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 构造服务解析键，路由标签按 `k=v` 形式作为标签
    pub fn service_key(&self, default_protocol: &str, env: &str) -> ServiceKey {
        let protocol = if self.protocol.is_empty() {
            default_protocol
        } else {
            self.protocol.as_str()
        };
        ServiceKey::new(self.microservice_name.clone(), protocol, env)
            .with_dc(self.dc.clone())
            .with_tags(self.route_tags.iter().map(|(k, v)| format!("{}={}", k, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_indistinguishable_from_new() {
        let mut inv = Invocation::new("user", "/users/1")
            .with_route_tag("version", "v2")
            .with_metadata("x-trace", "abc")
            .with_body("payload");
        inv.endpoint = Some("10.0.0.1:80".to_string());
        inv.session_id = Some("s-1".to_string());
        inv.timeout = Some(Duration::from_secs(1));
        inv.strategy = Some("random".to_string());

        inv.reset();
        assert_eq!(inv, Invocation::default());
        assert!(inv.route_tags.is_empty());
        assert!(inv.metadata.is_empty());
    }

    #[test]
    fn service_key_uses_route_tags() {
        let inv = Invocation::new("user", "/users/1").with_route_tag("version", "v2");
        let key = inv.service_key("http", "prod");
        assert_eq!(key.tags, vec!["version=v2".to_string()]);
        assert_eq!(key.std_registry_name, "user-http-prod");
    }
}
