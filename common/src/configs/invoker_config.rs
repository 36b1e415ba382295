use std::time::Duration;

use serde::Deserialize;

/// 调用编排配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InvokerConfig {
    /// 配置后所有调用都经由 sidecar 转发
    pub sidecar_address: Option<String>,
    /// 默认调用超时（毫秒），0 表示不限
    pub timeout_ms: u64,
    /// 默认协议
    pub protocol: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            sidecar_address: None,
            timeout_ms: 0,
            protocol: "http".to_string(),
        }
    }
}

impl InvokerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}
