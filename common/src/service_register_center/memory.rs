use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::service_register_center::typos::Service;
use crate::service_register_center::ServiceRegister;
use crate::Error;

/// meta 中记录数据中心的键
pub const META_DC: &str = "dc";

/// 进程内注册中心
///
/// 用于静态部署和测试；`set_available(false)` 模拟后端传输故障
#[derive(Debug)]
pub struct MemoryRegistry {
    services: DashMap<String, Vec<Service>>,
    available: AtomicBool,
    lookups: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            available: AtomicBool::new(true),
            lookups: AtomicUsize::new(0),
        }
    }

    /// 直接写入一个实例，同 ID 的旧实例会被替换
    pub fn insert(&self, service: Service) {
        let mut entry = self.services.entry(service.name.clone()).or_default();
        entry.retain(|s| s.id() != service.id());
        entry.push(service);
    }

    pub fn remove_name(&self, name: &str) {
        self.services.remove(name);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 累计查询次数
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Registry("memory registry unavailable".to_string()))
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegister for MemoryRegistry {
    async fn register(&self, service: &Service) -> Result<String, Error> {
        self.check_available()?;
        service.validate()?;
        let id = service.id().to_string();
        self.insert(service.clone());
        debug!("Registered in memory: {} ({})", service.name, id);
        Ok(id)
    }

    async fn deregister(&self, service_id: &str) -> Result<(), Error> {
        self.check_available()?;
        for mut entry in self.services.iter_mut() {
            entry.retain(|s| s.id() != service_id);
        }
        self.services.retain(|_, services| !services.is_empty());
        Ok(())
    }

    async fn lookup(&self, name: &str, dc: &str, tags: &[String]) -> Result<Vec<Service>, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let services: Vec<Service> = self
            .services
            .get(name)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|s| dc.is_empty() || s.meta.get(META_DC).map_or(true, |d| d == dc))
                    .filter(|s| tags.iter().all(|t| s.tags.contains(t)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if services.is_empty() {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_filters_by_tags_and_dc() {
        let registry = MemoryRegistry::new();
        registry.insert(Service::new("user", "10.0.0.1", 80).with_tags(["v1"]));
        registry.insert(
            Service::new("user", "10.0.0.2", 80)
                .with_tags(["v2"])
                .with_meta(META_DC, "dc2"),
        );

        assert_eq!(registry.lookup("user", "", &[]).await.unwrap().len(), 2);
        let v2 = registry.lookup("user", "", &["v2".to_string()]).await.unwrap();
        assert_eq!(v2[0].ip, "10.0.0.2");
        let dc1 = registry.lookup("user", "dc1", &[]).await.unwrap();
        assert_eq!(dc1.len(), 1);
        assert_eq!(dc1[0].ip, "10.0.0.1");

        assert!(matches!(
            registry.lookup("order", "", &[]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_is_not_not_found() {
        let registry = MemoryRegistry::new();
        registry.insert(Service::new("user", "10.0.0.1", 80));
        registry.set_available(false);
        assert!(matches!(
            registry.lookup("user", "", &[]).await,
            Err(Error::Registry(_))
        ));
        assert_eq!(registry.lookup_count(), 1);
    }

    #[tokio::test]
    async fn register_deregister_should_work() {
        let registry = MemoryRegistry::new();
        let id = registry
            .register(&Service::new("user", "10.0.0.1", 80))
            .await
            .unwrap();
        registry.deregister(&id).await.unwrap();
        assert!(registry.lookup("user", "", &[]).await.is_err());

        let invalid = Service::new("user", "10.0.0.1", 80).with_weight(0);
        assert!(matches!(
            registry.register(&invalid).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
