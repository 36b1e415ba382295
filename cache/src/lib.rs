/**
 * 快照缓存模块
 *
 * 本模块提供服务实例快照的持久化接口和实现。
 * 注册中心不可用时，解析器从这里读取最近一次成功解析的实例列表作为冷启动兜底。
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use common::configs::RegistryConfig;
use common::error::Error;
use common::service_register_center::typos::{Service, ServiceKey};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// 快照存储特征
///
/// 每个 ServiceKey 对应一份实例列表
#[async_trait]
pub trait SnapshotStore: Sync + Send + Debug {
    /// 读取快照，不存在时返回 None
    async fn load(&self, key: &ServiceKey) -> Result<Option<Vec<Service>>, Error>;

    /// 覆盖写入快照
    async fn store(&self, key: &ServiceKey, services: &[Service]) -> Result<(), Error>;

    /// 丢弃进程内的已加载副本，下一次 load 重新读取
    async fn invalidate(&self, key: &ServiceKey) -> Result<(), Error>;
}

/// 根据配置创建快照存储
///
/// 配置了缓存目录时使用文件存储，否则只保存在进程内
pub fn snapshot_store(config: &RegistryConfig) -> Arc<dyn SnapshotStore> {
    match &config.cache_dir {
        Some(dir) => Arc::new(FileStore::new(dir.clone())),
        None => Arc::new(MemoryStore::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_picks_store_by_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let key = ServiceKey::new("user", "http", "");
        let store = snapshot_store(&config);
        store
            .store(&key, &[Service::new("user", "10.0.0.1", 80)])
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let in_memory = snapshot_store(&RegistryConfig::default());
        assert_eq!(in_memory.load(&key).await.unwrap(), None);
    }
}
