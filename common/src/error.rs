use std::time::Duration;

use thiserror::Error;

/// 运行时核心的统一错误类型
///
/// 所有负载都是渲染后的字符串，因此错误可以 `Clone`，
/// 请求合并器需要把同一个结果分发给所有等待者。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("服务不存在: {0}")]
    NotFound(String),

    #[error("参数无效: {0}")]
    InvalidArgument(String),

    #[error("注册中心降级: {0}")]
    Degraded(String),

    #[error("调用已取消")]
    Cancelled,

    #[error("调用超时: {0}")]
    Timeout(String),

    #[error("服务不可用: {0}")]
    Unavailable(String),

    #[error("熔断器已打开: {0}")]
    CircuitOpen(String),

    #[error("注册中心错误: {0}")]
    Registry(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO错误: {0}")]
    IO(String),

    #[error("JSON错误: {0}")]
    Json(String),

    #[error("内部服务错误: {0}")]
    Internal(String),
}

impl Error {
    /// 只有 NotFound 可以在解析层级之间继续尝试
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// 编排器据此决定是否重试；显式取消永远不重试，超时可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Unavailable(_) | Error::Registry(_)
        )
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Error::Timeout(format!("{}ms", elapsed.as_millis()))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Internal(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Error::Unavailable(err.to_string()),
            _ => Error::IO(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

// reqwest错误转换实现：超时和连接失败需要区分出来，重试策略依赖这个区分
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() {
            Error::Unavailable(err.to_string())
        } else if err.is_decode() {
            Error::Json(err.to_string())
        } else {
            Error::Registry(format!("HTTP request failed: {}", err))
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
