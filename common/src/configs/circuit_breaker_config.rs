use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// 服务类型：调用方
pub const CONSUMER: &str = "Consumer";
/// 服务类型：提供方
pub const PROVIDER: &str = "Provider";

/// 熔断配置
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// 开启熔断功能
    pub enabled: bool,
    /// 最大并发请求数
    pub max_concurrent_requests: u32,
    /// 错误百分比阈值
    pub error_threshold_percentage: u32,
    /// 统计窗口内触发熔断的最小请求数
    pub request_volume_threshold: u32,
    /// 熔断后多久进入半开（毫秒）
    pub sleep_window_ms: u64,
    /// 强制打开
    pub force_open: bool,
    /// 强制关闭
    pub force_closed: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_requests: 1000,
            error_threshold_percentage: 50,
            request_volume_threshold: 20,
            sleep_window_ms: 15_000,
            force_open: false,
            force_closed: false,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.sleep_window_ms)
    }
}

/// 熔断配置段
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// 按服务类型的默认配置
    pub scopes: HashMap<String, CircuitBreakerConfig>,
    /// 服务类型 -> 服务名 -> 配置
    pub services: HashMap<String, HashMap<String, CircuitBreakerConfig>>,
}

impl CircuitBreakerSection {
    /// 服务显式开启了熔断时返回它自己的配置
    pub fn service(&self, service_type: &str, service_name: &str) -> Option<&CircuitBreakerConfig> {
        self.services
            .get(service_type)
            .and_then(|services| services.get(service_name))
            .filter(|config| config.enabled)
    }
}
