// 导入标准库和必要的依赖
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::configs::RegistryConfig;
use crate::Error;

// 声明子模块
pub mod consul;
pub mod memory;
pub mod typos;

// 导入类型定义
pub use crate::service_register_center::consul::Consul;
pub use crate::service_register_center::memory::MemoryRegistry;
pub use crate::service_register_center::typos::{
    HealthCheck, RegisterOptions, RunMode, Service, ServiceKey, ServiceList,
};

/// 注册中心后端接口
///
/// 定义了服务注册、注销和查询的核心功能。
/// 查询结果为空时必须返回 `Error::NotFound`，调用方依赖这个区分决定是否尝试下一个名字。
#[async_trait]
pub trait ServiceRegister: Send + Sync + Debug {
    /// 向注册中心注册服务，返回实例ID
    async fn register(&self, service: &Service) -> Result<String, Error>;

    /// 从注册中心注销服务
    async fn deregister(&self, service_id: &str) -> Result<(), Error>;

    /// 按名称、数据中心和标签查询健康实例
    async fn lookup(&self, name: &str, dc: &str, tags: &[String]) -> Result<Vec<Service>, Error>;

    /// 释放后端持有的资源
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// 注册中心工厂函数
pub type RegistryFactory = fn(&RegistryConfig) -> Result<Arc<dyn ServiceRegister>, Error>;

/// 按名称注册的后端工厂表
///
/// 初始化时装入 consul 和 memory，嵌入方可以继续安装自己的实现
pub struct RegistryBuilders {
    factories: DashMap<String, RegistryFactory>,
}

impl RegistryBuilders {
    pub fn new() -> Self {
        let builders = Self {
            factories: DashMap::new(),
        };
        builders.install("consul", |config| Ok(Arc::new(Consul::from_config(config)?)));
        builders.install("memory", |_| Ok(Arc::new(MemoryRegistry::new())));
        builders
    }

    /// 安装（或替换）一个后端工厂
    pub fn install(&self, name: &str, factory: RegistryFactory) {
        debug!("Installing registry builder: {}", name);
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// 根据配置中的 kind 创建后端
    pub fn build(&self, config: &RegistryConfig) -> Result<Arc<dyn ServiceRegister>, Error> {
        let factory = self
            .factories
            .get(&config.kind)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::InvalidArgument(format!("未知的注册中心类型: {}", config.kind)))?;
        factory(config)
    }
}

impl Default for RegistryBuilders {
    fn default() -> Self {
        Self::new()
    }
}

/// 创建服务注册中心实例
///
/// 根据配置创建服务注册中心的具体实现
pub fn service_register_center(config: &RegistryConfig) -> Result<Arc<dyn ServiceRegister>, Error> {
    RegistryBuilders::default().build(config)
}
