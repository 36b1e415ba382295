use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 服务发现配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    /// 注册中心类型：consul 或 memory
    pub kind: String,
    /// 注册中心地址，例如 `http://127.0.0.1:8500`
    pub address: String,
    /// 备用发现地址，主地址传输失败时使用
    pub secondary_address: Option<String>,
    /// 本地快照缓存目录，未配置时不做冷启动兜底
    pub cache_dir: Option<PathBuf>,
    /// 请求超时（毫秒）
    pub timeout_ms: u64,
    /// 内存缓存有效期（毫秒）
    pub cache_ttl_ms: u64,
    /// watch 轮询间隔（毫秒）
    pub watch_interval_ms: u64,
    /// 默认数据中心
    pub dc: String,
    /// 部署环境，参与标准命名
    pub env: String,
    /// 抖动退避
    pub churn: ChurnConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: "consul".to_string(),
            address: "http://127.0.0.1:8500".to_string(),
            secondary_address: None,
            cache_dir: None,
            timeout_ms: 3000,
            cache_ttl_ms: 5000,
            watch_interval_ms: 10_000,
            dc: String::new(),
            env: String::new(),
            churn: ChurnConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

/// 实例列表抖动检测的退避配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChurnConfig {
    /// 延迟上限（毫秒）
    pub latency_ms: u64,
    /// 连续触发后是否升级延迟并加抖动
    pub shift: bool,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            latency_ms: 10_000,
            shift: false,
        }
    }
}

/// 自我保护配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SelfProtectionConfig {
    pub enabled: bool,
    /// 快照源地址
    pub address: String,
    /// 路径模板，`{service}` 会被替换为服务名
    pub path: String,
    /// 拉取间隔（秒）
    pub fetch_interval_secs: u64,
    /// 未访问超过该时长（秒）的键会被清理
    pub clean_interval_secs: u64,
    /// 单次拉取超时（毫秒）
    pub timeout_ms: u64,
}

impl Default for SelfProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "http://127.0.0.1:8080".to_string(),
            path: "/v1/sentinel/{service}".to_string(),
            fetch_interval_secs: 120,
            clean_interval_secs: 600,
            timeout_ms: 3000,
        }
    }
}

impl SelfProtectionConfig {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
