use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::configs::LogConfig;

// 日志输出格式类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    // 普通文本格式
    Plain,
    // JSON格式，适合ELK等日志聚合系统
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// 运行时核心各组件的 tracing target
const COMPONENTS: [&str; 5] = ["registry", "balancer", "circuit_breaker", "invoker", "cache"];

/// 使用默认级别初始化日志系统
pub fn init() -> Result<()> {
    init_from_config(&LogConfig::default())
}

/// 从配置初始化日志系统
///
/// 可以重复调用，已经安装过订阅器时直接返回
///
/// # 示例
/// ```
/// use common::configs::LogConfig;
/// use common::logging;
///
/// fn main() -> anyhow::Result<()> {
///     logging::init_from_config(&LogConfig::default())?;
///     tracing::info!("日志系统从配置初始化成功");
///     Ok(())
/// }
/// ```
pub fn init_from_config(config: &LogConfig) -> Result<()> {
    let env_filter = build_filter(config);

    // 确定日志格式
    let log_format = config
        .format
        .as_deref()
        .map(LogFormat::parse)
        .unwrap_or(LogFormat::Plain);

    // 根据配置的输出格式选择日志输出方式
    let installed = match log_format {
        LogFormat::Plain => fmt()
            .with_env_filter(env_filter)
            .with_ansi(true)
            .with_thread_names(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_thread_names(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        info!("日志系统从配置初始化成功，全局级别: {}", config.level);
        info!("日志格式: {:?}", log_format);
    }

    Ok(())
}

/// 构建过滤器：RUST_LOG 优先，其次是配置，最后叠加组件级环境变量
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    let env_filter = match env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(config.filter_directives()),
    };
    check_env_component_overrides(env_filter)
}

/// 检查环境变量中是否有组件特定的日志级别覆盖，例如 RUST_LOG_BALANCER=debug
fn check_env_component_overrides(mut env_filter: EnvFilter) -> EnvFilter {
    for component in &COMPONENTS {
        let env_var_name = format!("RUST_LOG_{}", component.to_uppercase());
        if let Ok(level) = env::var(&env_var_name) {
            // 尝试添加指令，如果解析失败则忽略
            if let Ok(directive) = format!("{}={}", component, level).parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    env_filter
}
