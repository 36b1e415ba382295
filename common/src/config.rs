use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use tracing::info;

use crate::configs::{
    CircuitBreakerSection, InvokerConfig, LoadBalancingSection, LogConfig, RegistryConfig,
    SelfProtectionConfig,
};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub self_protection: SelfProtectionConfig,
    pub load_balancing: LoadBalancingSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub invoker: InvokerConfig,
    pub log: LogConfig,
}

impl AppConfig {
    // 创建一个新的AppConfig实例
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file(None)
    }

    // 从多个来源加载配置
    pub fn from_file(file_path: Option<&str>) -> Result<Self, ConfigError> {
        // 开始构建配置
        let mut builder = Config::builder();

        // 1. 配置文件 (如果指定)
        if let Some(path) = file_path {
            if Path::new(path).exists() {
                let format = if path.ends_with(".json") {
                    FileFormat::Json
                } else if path.ends_with(".yaml") || path.ends_with(".yml") {
                    FileFormat::Yaml
                } else {
                    FileFormat::Toml
                };

                builder = builder.add_source(File::with_name(path).format(format));
            }
        } else {
            // 默认配置文件，不存在时全部使用默认值
            builder = builder.add_source(
                File::with_name("./config/config.yaml")
                    .format(FileFormat::Yaml)
                    .required(false),
            );
        }

        // 2. 读取环境变量 (最高优先级)，例如 MESH__REGISTRY__ADDRESS
        builder = builder.add_source(
            config::Environment::with_prefix("MESH")
                .prefix_separator("__")
                .separator("__"),
        );

        // 构建配置
        let config = builder.build()?;

        // 转换为AppConfig结构体
        config.try_deserialize()
    }
}

/// 可热更新的配置
///
/// 读方每次操作取一次快照，永远看不到更新到一半的配置
#[derive(Debug)]
pub struct SharedConfig {
    current: ArcSwap<AppConfig>,
    version: AtomicU64,
}

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            version: AtomicU64::new(1),
        }
    }

    pub fn load(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// 原子替换配置，返回新版本号
    pub fn reload(&self, config: AppConfig) -> u64 {
        self.current.store(Arc::new(config));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!("配置已重新加载, 版本: {}", version);
        version
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
