use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

pub const STRATEGY_ROUND_ROBIN: &str = "round_robin";
pub const STRATEGY_RANDOM: &str = "random";
pub const STRATEGY_WEIGHTED_ROUND_ROBIN: &str = "weighted_round_robin";
pub const STRATEGY_WEIGHTED_RANDOM: &str = "weighted_random";

/// 重试退避类型
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    None,
    Constant,
    Jitter,
    Exponential,
}

/// 重试退避配置
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    /// 最小间隔（毫秒）
    pub min_ms: u64,
    /// 最大间隔（毫秒）
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::None,
            min_ms: 0,
            max_ms: 0,
        }
    }
}

/// 单个服务的负载均衡策略
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoadBalancingConfig {
    /// 负载均衡策略名称，对应已注册的构建器
    pub strategy: String,
    pub retry_enabled: bool,
    /// 同一实例上的重试次数
    pub retry_on_same: u32,
    /// 换实例重试的次数
    pub retry_on_next: u32,
    pub backoff: BackoffConfig,
    /// 会话粘滞窗口（秒），0 表示关闭
    pub session_stickiness_secs: u64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: STRATEGY_WEIGHTED_ROUND_ROBIN.to_string(),
            retry_enabled: false,
            retry_on_same: 0,
            retry_on_next: 0,
            backoff: BackoffConfig::default(),
            session_stickiness_secs: 0,
        }
    }
}

impl LoadBalancingConfig {
    pub fn stickiness(&self) -> Option<Duration> {
        (self.session_stickiness_secs > 0).then(|| Duration::from_secs(self.session_stickiness_secs))
    }
}

/// 黑白名单心跳配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlackWhiteListConfig {
    pub enabled: bool,
    /// 心跳间隔（毫秒）
    pub interval_ms: u64,
    /// TCP 拨号超时（毫秒）
    pub dial_timeout_ms: u64,
    /// 超过该失败次数后强制解除屏蔽
    pub max_misses: u32,
}

impl Default for BlackWhiteListConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            dial_timeout_ms: 300,
            max_misses: 10,
        }
    }
}

impl BlackWhiteListConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// 负载均衡配置段
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoadBalancingSection {
    pub default: LoadBalancingConfig,
    /// 按服务名覆盖
    pub services: HashMap<String, LoadBalancingConfig>,
    pub black_white_list: BlackWhiteListConfig,
}

impl LoadBalancingSection {
    pub fn for_service(&self, service: &str) -> &LoadBalancingConfig {
        self.services.get(service).unwrap_or(&self.default)
    }
}
