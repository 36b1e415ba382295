use async_trait::async_trait;
use dashmap::DashMap;

use common::error::Error;
use common::service_register_center::typos::{Service, ServiceKey};

use crate::SnapshotStore;

/// 进程内快照，未配置缓存目录时使用
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: DashMap<ServiceKey, Vec<Service>>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, key: &ServiceKey) -> Result<Option<Vec<Service>>, Error> {
        Ok(self.snapshots.get(key).map(|entry| entry.value().clone()))
    }

    async fn store(&self, key: &ServiceKey, services: &[Service]) -> Result<(), Error> {
        self.snapshots.insert(key.clone(), services.to_vec());
        Ok(())
    }

    async fn invalidate(&self, key: &ServiceKey) -> Result<(), Error> {
        self.snapshots.remove(key);
        Ok(())
    }
}
