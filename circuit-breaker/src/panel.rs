use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use common::config::SharedConfig;
use common::configs::{CircuitBreakerConfig, CircuitBreakerSection, CONSUMER, PROVIDER};
use common::invocation::Invocation;

/// 调用方视角取目标服务名，提供方视角取来源服务名
pub fn service_name<'a>(inv: &'a Invocation, service_type: &str) -> &'a str {
    if service_type == PROVIDER {
        &inv.source_service
    } else {
        &inv.microservice_name
    }
}

pub fn scope_key(service_type: &str, service_name: &str) -> String {
    format!("{}:{}", service_type, service_name)
}

/// 熔断配置面板
///
/// 两级缓存：`{serviceType}` 存放服务类型的默认配置，`{serviceType}:{serviceName}`
/// 存放显式开启了熔断的服务自己的配置。两级条目都只由重载写入，读路径只读并发 map。
#[derive(Debug)]
pub struct CircuitBreakerPanel {
    entries: DashMap<String, Arc<CircuitBreakerConfig>>,
    /// 最近一次同步的 SharedConfig 版本
    synced: AtomicU64,
}

impl CircuitBreakerPanel {
    pub fn new(section: CircuitBreakerSection) -> Self {
        let panel = Self {
            entries: DashMap::new(),
            synced: AtomicU64::new(0),
        };
        panel.reload(section);
        panel
    }

    pub fn from_shared(shared: &SharedConfig) -> Self {
        let panel = Self::new(shared.load().circuit_breaker.clone());
        panel.synced.store(shared.version(), Ordering::Release);
        panel
    }

    /// 取本次调用生效的熔断配置
    ///
    /// 服务在最新配置中显式开启了熔断时返回重载时算好的服务级配置，否则返回服务类型的默认配置
    pub fn get_circuit_breaker(&self, inv: &Invocation, service_type: &str) -> Arc<CircuitBreakerConfig> {
        let name = service_name(inv, service_type);
        if let Some(entry) = self.entries.get(&scope_key(service_type, name)) {
            return entry.value().clone();
        }
        self.default_for(service_type)
    }

    /// 服务类型的默认配置，未知类型使用内置默认值
    pub fn default_for(&self, service_type: &str) -> Arc<CircuitBreakerConfig> {
        self.entries
            .get(service_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Arc::new(CircuitBreakerConfig::default()))
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreakerConfig>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 应用新配置：先写入新键集合的全部条目，再删除不在新集合里的旧键，
    /// 重载期间读方不会看到空缓存
    pub fn reload(&self, section: CircuitBreakerSection) {
        let mut next: Vec<(String, Arc<CircuitBreakerConfig>)> = Vec::new();

        let mut scopes: Vec<&str> = vec![CONSUMER, PROVIDER];
        for scope in section.scopes.keys() {
            if !scopes.contains(&scope.as_str()) {
                scopes.push(scope.as_str());
            }
        }
        for scope in scopes {
            let config = section.scopes.get(scope).cloned().unwrap_or_default();
            next.push((scope.to_string(), Arc::new(config)));
        }
        for (service_type, services) in &section.services {
            for name in services.keys() {
                if let Some(config) = section.service(service_type, name) {
                    next.push((scope_key(service_type, name), Arc::new(config.clone())));
                }
            }
        }

        let keep: HashSet<String> = next.iter().map(|(key, _)| key.clone()).collect();
        for (key, config) in next {
            self.entries.insert(key, config);
        }

        let before = self.entries.len();
        self.entries.retain(|key, _| keep.contains(key));
        let pruned = before - self.entries.len();
        info!(
            "Circuit breaker config reloaded: {} entries, {} pruned",
            self.entries.len(),
            pruned
        );
    }

    /// SharedConfig 版本变化时重新加载，返回是否发生了重载
    pub fn sync(&self, shared: &SharedConfig) -> bool {
        let version = shared.version();
        if self.synced.swap(version, Ordering::AcqRel) == version {
            return false;
        }
        debug!("Config version {} observed, reloading circuit breakers", version);
        self.reload(shared.load().circuit_breaker.clone());
        true
    }
}

impl Default for CircuitBreakerPanel {
    fn default() -> Self {
        Self::new(CircuitBreakerSection::default())
    }
}
