// 导入 serde 用于序列化和反序列化
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};

use crate::Error;

/// 默认权重
pub const DEFAULT_WEIGHT: i32 = 100;

/// meta 中的常用键
pub const META_REGION: &str = "region";
pub const META_ZONE: &str = "zone";
pub const META_CONTAINER: &str = "container";
pub const META_STATUS: &str = "status";
pub const META_WEIGHT: &str = "weight";

static HOSTNAME: Lazy<String> = Lazy::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
});

/// 服务实例
///
/// 注册到注册中心或者从注册中心解析出来的一个实例。
/// `id` 为空时由 name + ip + port + hostname 推导，且进程内只计算一次。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Service {
    /// 显式指定的实例ID，为空时自动推导
    #[serde(default)]
    pub id: String,
    /// 服务名称
    pub name: String,
    /// 实例地址
    pub ip: String,
    /// 实例端口
    pub port: u16,
    /// 权重，用于加权负载均衡，必须为正数
    #[serde(default = "default_weight")]
    pub weight: i32,
    /// 标签，始终保持有序，保证缓存键稳定
    #[serde(default)]
    pub tags: Vec<String>,
    /// 元数据：region、zone、容器类型、状态、权重镜像
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// 交给注册中心执行的健康检查
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<HealthCheck>,
    #[serde(skip)]
    derived_id: OnceCell<String>,
}

fn default_weight() -> i32 {
    DEFAULT_WEIGHT
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            ip: String::new(),
            port: 0,
            weight: DEFAULT_WEIGHT,
            tags: Vec::new(),
            meta: HashMap::new(),
            check: None,
            derived_id: OnceCell::new(),
        }
    }
}

impl Service {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self.derived_id = OnceCell::new();
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self.meta.insert(META_WEIGHT.to_string(), weight.to_string());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = sorted_tags(tags);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// 实例ID，首次调用时推导并缓存
    pub fn id(&self) -> &str {
        if !self.id.is_empty() {
            return &self.id;
        }
        self.derived_id.get_or_init(|| {
            format!("{}-{}-{}-{}", self.name, self.ip, self.port, HOSTNAME.as_str())
        })
    }

    /// `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// 以另一个名字注册时使用的副本；显式ID会带上名字后缀，避免两次注册互相覆盖
    pub fn renamed(&self, name: &str) -> Service {
        let mut service = self.clone();
        service.name = name.to_string();
        service.derived_id = OnceCell::new();
        if !self.id.is_empty() {
            service.id = format!("{}@{}", self.id, name);
        }
        service
    }

    /// 注册前的校验
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("服务名称不能为空".to_string()));
        }
        if self.ip.is_empty() {
            return Err(Error::InvalidArgument(format!("服务 {} 缺少地址", self.name)));
        }
        if self.port == 0 {
            return Err(Error::InvalidArgument(format!("服务 {} 端口无效", self.name)));
        }
        if self.weight <= 0 {
            return Err(Error::InvalidArgument(format!(
                "服务 {} 权重必须为正数: {}",
                self.name, self.weight
            )));
        }
        Ok(())
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
            && self.name == other.name
            && self.ip == other.ip
            && self.port == other.port
            && self.weight == other.weight
            && self.tags == other.tags
            && self.meta == other.meta
            && self.check == other.check
    }
}

impl Eq for Service {}

/// 健康检查配置
///
/// 由注册中心执行的主动健康检查，与负载均衡器自身的黑白名单心跳相互独立
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// 健康检查名称
    pub name: String,
    /// 健康检查的时间间隔，例如 "10s"
    pub interval: String,
    /// 健康检查的超时时间
    pub timeout: String,
    /// HTTP 检查地址，与 tcp 二选一
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    /// TCP 检查目标 `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    /// HTTP 方法
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// HTTP 请求头
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// 服务不健康后多久取消注册
    #[serde(default)]
    pub deregister_after: String,
}

/// 注册/注销时用于推导两种命名约定的参数
#[derive(Debug, Default, Clone)]
pub struct RegisterOptions {
    pub protocol: String,
    pub env: String,
}

/// 旧命名约定：`{name}-{protocol}`
pub fn legacy_name(name: &str, protocol: &str) -> String {
    if protocol.is_empty() {
        name.to_string()
    } else {
        format!("{}-{}", name, protocol)
    }
}

/// 标准命名约定：`{name}-{protocol}-{env}`，空段省略
pub fn std_name(name: &str, protocol: &str, env: &str) -> String {
    [name, protocol, env]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}

fn sorted_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tags: Vec<String> = tags.into_iter().map(Into::into).collect();
    tags.sort();
    tags.dedup();
    tags
}

/// 服务解析键
///
/// 两个键相等当且仅当 origin_name、dc 和排序后的 tags 相同。
/// `name` 记录最近一次成功解析的层级名称，不参与比较。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceKey {
    pub origin_name: String,
    pub name: String,
    pub registry_name: String,
    pub std_registry_name: String,
    pub dc: String,
    pub tags: Vec<String>,
    pub protocol: String,
    pub env: String,
}

impl ServiceKey {
    pub fn new(origin_name: impl Into<String>, protocol: impl Into<String>, env: impl Into<String>) -> Self {
        let origin_name = origin_name.into();
        let protocol = protocol.into();
        let env = env.into();
        Self {
            name: origin_name.clone(),
            registry_name: legacy_name(&origin_name, &protocol),
            std_registry_name: std_name(&origin_name, &protocol, &env),
            origin_name,
            dc: String::new(),
            tags: Vec::new(),
            protocol,
            env,
        }
    }

    pub fn with_dc(mut self, dc: impl Into<String>) -> Self {
        self.dc = dc.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = sorted_tags(tags);
        self
    }

    /// 按顺序尝试的解析层级：标准名、旧名、原始名，重复的名字只保留一次
    pub fn tier_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(3);
        for name in [&self.std_registry_name, &self.registry_name, &self.origin_name] {
            if !name.is_empty() && !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// 用作缓存文件名和各类映射键的稳定字符串
    pub fn cache_key(&self) -> String {
        format!("{}@{}#{}", self.origin_name, self.dc, self.tags.join(","))
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.origin_name == other.origin_name && self.dc == other.dc && self.tags == other.tags
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin_name.hash(state);
        self.dc.hash(state);
        self.tags.hash(state);
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// 实例列表的来源
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Normal,
    /// 注册中心不可用时从本地缓存恢复
    Recover,
    /// 自我保护：使用降级快照
    SelfProtection,
    Init,
    Panic,
}

/// 带版本的实例快照
///
/// 版本号单调递增，消费方只能以版本号作为顺序依据，旧版本必须丢弃
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceList {
    pub version: u64,
    pub run_mode: RunMode,
    /// 实际解析成功的注册名称
    pub name: String,
    pub services: Vec<Service>,
}

impl ServiceList {
    pub fn new(version: u64, name: impl Into<String>, services: Vec<Service>) -> Self {
        Self {
            version,
            run_mode: RunMode::Normal,
            name: name.into(),
            services,
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// 比较实例集合是否相同，与顺序无关
    pub fn same_instances(&self, services: &[Service]) -> bool {
        if self.services.len() != services.len() {
            return false;
        }
        let mut left: Vec<&Service> = self.services.iter().collect();
        let mut right: Vec<&Service> = services.iter().collect();
        left.sort_by(|a, b| a.id().cmp(b.id()));
        right.sort_by(|a, b| a.id().cmp(b.id()));
        left == right
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_is_stable() {
        let service = Service::new("user", "10.0.0.1", 8080);
        let first = service.id().to_string();
        assert_eq!(service.id(), first);
        assert!(first.starts_with("user-10.0.0.1-8080-"));

        let explicit = Service::new("user", "10.0.0.1", 8080).with_id("u-1");
        assert_eq!(explicit.id(), "u-1");
    }

    #[test]
    fn validate_rejects_bad_weight() {
        let service = Service::new("user", "10.0.0.1", 8080).with_weight(0);
        assert!(matches!(service.validate(), Err(Error::InvalidArgument(_))));
        let service = Service::new("user", "10.0.0.1", 8080).with_weight(-3);
        assert!(matches!(service.validate(), Err(Error::InvalidArgument(_))));
        let service = Service::new("", "10.0.0.1", 8080);
        assert!(matches!(service.validate(), Err(Error::InvalidArgument(_))));
        assert!(Service::new("user", "10.0.0.1", 8080).validate().is_ok());
    }

    #[test]
    fn key_equality_ignores_protocol_and_resolved_name() {
        let a = ServiceKey::new("user", "http", "prod").with_tags(["b", "a"]);
        let mut b = ServiceKey::new("user", "grpc", "test").with_tags(["a", "b"]);
        b.name = "user-grpc".to_string();
        assert_eq!(a, b);
        assert_eq!(a.tags, vec!["a".to_string(), "b".to_string()]);

        let c = a.clone().with_dc("dc2");
        assert_ne!(a, c);
    }

    #[test]
    fn tier_names_are_ordered_and_unique() {
        let key = ServiceKey::new("user", "http", "prod");
        assert_eq!(key.tier_names(), vec!["user-http-prod", "user-http", "user"]);

        let bare = ServiceKey::new("user", "", "");
        assert_eq!(bare.tier_names(), vec!["user"]);
    }

    #[test]
    fn renamed_keeps_explicit_ids_apart() {
        let service = Service::new("user", "10.0.0.1", 8080).with_id("u-1");
        let legacy = service.renamed("user-http");
        let standard = service.renamed("user-http-prod");
        assert_ne!(legacy.id(), standard.id());
        assert_eq!(legacy.name, "user-http");
    }
}
