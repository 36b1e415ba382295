use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use cache::{snapshot_store, SnapshotStore};
use common::coalescer::Coalescer;
use common::configs::{ChurnConfig, RegistryConfig};
use common::service_register_center::typos::{
    legacy_name, std_name, RegisterOptions, RunMode, Service, ServiceKey, ServiceList,
};
use common::service_register_center::{service_register_center, ServiceRegister};
use common::window::AdaptiveBackoff;
use common::{Error, Result};

use crate::{Discovery, Watcher};

/// 解析器参数
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// 内存缓存有效期，过期后下一次解析会访问注册中心
    pub cache_ttl: Duration,
    /// watch 轮询间隔
    pub watch_interval: Duration,
    pub churn: ChurnConfig,
}

impl ResolverOptions {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            watch_interval: config.watch_interval(),
            churn: config.churn.clone(),
        }
    }
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

struct CacheEntry {
    list: Arc<ServiceList>,
    expires_at: Instant,
}

/// 一个键上的所有订阅者共享的轮询状态
struct WatchState {
    /// 订阅时的键，`name` 是优先尝试的注册名
    key: ServiceKey,
    watchers: RwLock<Vec<Arc<dyn Watcher>>>,
    backoff: AdaptiveBackoff,
    /// 最后一个订阅者退订时取消，结束该键的轮询
    stop: CancellationToken,
}

struct Inner {
    backend: Arc<dyn ServiceRegister>,
    store: Arc<dyn SnapshotStore>,
    options: ResolverOptions,
    cache: DashMap<ServiceKey, CacheEntry>,
    versions: DashMap<ServiceKey, u64>,
    coalescer: Coalescer<ServiceKey, Arc<ServiceList>>,
    watches: DashMap<ServiceKey, Arc<WatchState>>,
    /// 暂停轮询的键，期间不访问注册中心
    held: DashSet<ServiceKey>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// 注册中心解析器
///
/// 缓存归解析器独占，负载均衡器只通过 watch 拿到只读快照
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl Resolver {
    pub fn new(
        backend: Arc<dyn ServiceRegister>,
        store: Arc<dyn SnapshotStore>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                options,
                cache: DashMap::new(),
                versions: DashMap::new(),
                coalescer: Coalescer::new(),
                watches: DashMap::new(),
                held: DashSet::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// 按配置创建注册中心后端和快照存储
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let backend = service_register_center(config)?;
        let store = snapshot_store(config);
        Ok(Self::new(backend, store, ResolverOptions::from_config(config)))
    }

    pub fn backend(&self) -> &Arc<dyn ServiceRegister> {
        &self.inner.backend
    }

    /// 以旧命名和标准命名各注册一次
    ///
    /// 第二次注册失败时第一次的结果不会回滚，由调用方通过 `deregister` 清理
    pub async fn register(&self, service: &Service, opts: &RegisterOptions) -> Result<()> {
        service.validate()?;
        let legacy = legacy_name(&service.name, &opts.protocol);
        let standard = std_name(&service.name, &opts.protocol, &opts.env);

        self.inner.backend.register(&service.renamed(&legacy)).await?;
        if standard != legacy {
            self.inner.backend.register(&service.renamed(&standard)).await?;
        }
        info!("Registered {} as {} and {}", service.name, legacy, standard);
        Ok(())
    }

    /// 注销两种命名下的实例，两次都会尝试，返回第一个错误
    pub async fn deregister(&self, service: &Service, opts: &RegisterOptions) -> Result<()> {
        let legacy = legacy_name(&service.name, &opts.protocol);
        let standard = std_name(&service.name, &opts.protocol, &opts.env);

        let mut result = self
            .inner
            .backend
            .deregister(service.renamed(&legacy).id())
            .await;
        if standard != legacy {
            let second = self
                .inner
                .backend
                .deregister(service.renamed(&standard).id())
                .await;
            result = result.and(second);
        }
        result
    }

    /// 当前缓存中的列表，不访问注册中心，过期的也会返回
    pub fn cached(&self, key: &ServiceKey) -> Option<Arc<ServiceList>> {
        self.inner.cache.get(key).map(|entry| entry.list.clone())
    }

    /// 键的当前版本
    pub fn version(&self, key: &ServiceKey) -> u64 {
        self.inner.versions.get(key).map(|v| *v).unwrap_or(0)
    }

    /// 分配键的下一个版本号，供外部推送的列表排在已有版本之后
    pub(crate) fn next_version(&self, key: &ServiceKey) -> u64 {
        self.inner.next_version(key)
    }

    /// 暂停键的 watch 轮询
    pub(crate) fn hold(&self, key: &ServiceKey) {
        if self.inner.held.insert(key.clone()) {
            debug!("Polling for {} held", key);
        }
    }

    /// 恢复轮询，并以新版本重新推送缓存中的列表，覆盖暂停期间外部推送的内容
    pub(crate) fn release(&self, key: &ServiceKey) {
        if self.inner.held.remove(key).is_some() {
            debug!("Polling for {} released", key);
            self.inner.republish(key);
        }
    }

    pub fn is_held(&self, key: &ServiceKey) -> bool {
        self.inner.held.contains(key)
    }

    /// 三级回退解析
    pub async fn resolve(&self, key: &mut ServiceKey) -> Result<Arc<ServiceList>> {
        if let Some(list) = self.fresh(key) {
            key.name = list.name.clone();
            return Ok(list);
        }

        let inner = self.inner.clone();
        let owned = key.clone();
        let list = self
            .inner
            .coalescer
            .run(key.clone(), move || inner.fetch(owned, None))
            .await?;
        key.name = list.name.clone();
        Ok(list)
    }

    pub async fn lookup(&self, key: &mut ServiceKey) -> Result<Vec<Service>> {
        let list = self.resolve(key).await?;
        Ok(list.services.clone())
    }

    /// 订阅键的变更
    ///
    /// 同一个键只有一个轮询任务；新订阅者会立即收到当前缓存的列表
    pub fn watch(&self, key: &ServiceKey, watcher: Arc<dyn Watcher>) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // 持有分片锁时加入订阅者，避免和 unwatch 移除空状态交错
        match self.inner.watches.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().watchers.write().push(watcher.clone()),
            Entry::Vacant(entry) => {
                let churn = &self.inner.options.churn;
                let state = Arc::new(WatchState {
                    key: key.clone(),
                    watchers: RwLock::new(vec![watcher.clone()]),
                    backoff: AdaptiveBackoff::new(Duration::from_millis(churn.latency_ms))
                        .with_shift(churn.shift),
                    stop: self.inner.shutdown.child_token(),
                });
                entry.insert(state.clone());
                self.inner
                    .tracker
                    .spawn(Inner::poll(self.inner.clone(), state));
            }
        }

        if let Some(list) = self.cached(key) {
            watcher.handle(key, list);
        }
        Ok(())
    }

    /// 退订；键上没有订阅者后停止轮询。返回是否找到该订阅者
    pub fn unwatch(&self, key: &ServiceKey, watcher: &Arc<dyn Watcher>) -> bool {
        let mut found = false;
        let emptied = self.inner.watches.remove_if(key, |_, state| {
            let mut watchers = state.watchers.write();
            let before = watchers.len();
            watchers.retain(|existing| !Arc::ptr_eq(existing, watcher));
            found = watchers.len() != before;
            watchers.is_empty()
        });
        if let Some((_, state)) = emptied {
            state.stop.cancel();
            debug!("Last watcher of {} left, polling stops", key);
        }
        found
    }

    pub fn watcher_count(&self, key: &ServiceKey) -> usize {
        self.inner
            .watches
            .get(key)
            .map(|state| state.watchers.read().len())
            .unwrap_or(0)
    }

    /// 停止所有 watch 任务并关闭后端，可以重复调用
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.backend.close().await
    }

    fn fresh(&self, key: &ServiceKey) -> Option<Arc<ServiceList>> {
        let entry = self.inner.cache.get(key)?;
        if entry.expires_at > Instant::now() && !entry.list.is_empty() {
            Some(entry.list.clone())
        } else {
            None
        }
    }
}

impl Inner {
    async fn fetch(self: Arc<Self>, key: ServiceKey, preferred: Option<String>) -> Result<Arc<ServiceList>> {
        match self.fetch_tiers(&key, preferred.as_deref()).await {
            Ok((name, services)) => Ok(self.apply(&key, name, services).await),
            Err(e) if e.is_not_found() => {
                self.vanish(&key);
                Err(e)
            }
            Err(e) => self.recover(&key, e).await,
        }
    }

    /// 依次尝试各级名称，只有 NotFound 会继续下一级
    async fn fetch_tiers(&self, key: &ServiceKey, preferred: Option<&str>) -> Result<(String, Vec<Service>)> {
        let mut names = key.tier_names();
        if let Some(preferred) = preferred {
            if let Some(pos) = names.iter().position(|name| name == preferred) {
                let name = names.remove(pos);
                names.insert(0, name);
            }
        }

        for name in names {
            match self.backend.lookup(&name, &key.dc, &key.tags).await {
                Ok(services) if !services.is_empty() => return Ok((name, services)),
                Ok(_) => debug!("Empty result for {}", name),
                Err(e) if e.is_not_found() => debug!("Service {} not found, trying next name", name),
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound(key.origin_name.clone()))
    }

    fn next_version(&self, key: &ServiceKey) -> u64 {
        let mut version = self.versions.entry(key.clone()).or_insert(0);
        *version += 1;
        *version
    }

    /// 写入缓存，实例集合变化时升版本、落盘并通知订阅者
    async fn apply(&self, key: &ServiceKey, name: String, services: Vec<Service>) -> Arc<ServiceList> {
        let expires_at = Instant::now() + self.options.cache_ttl;
        let unchanged = self.cache.get_mut(key).and_then(|mut entry| {
            let same = entry.list.run_mode == RunMode::Normal
                && entry.list.name == name
                && entry.list.same_instances(&services);
            if same {
                entry.expires_at = expires_at;
                Some(entry.list.clone())
            } else {
                None
            }
        });
        if let Some(list) = unchanged {
            return list;
        }

        let version = self.next_version(key);
        let list = Arc::new(ServiceList::new(version, name, services));
        self.cache.insert(
            key.clone(),
            CacheEntry {
                list: list.clone(),
                expires_at,
            },
        );
        debug!("Service {} updated to version {}", key, version);

        if let Err(e) = self.store.store(key, &list.services).await {
            warn!("Failed to persist snapshot for {}: {}", key, e);
        }
        self.notify(key, &list);
        list
    }

    /// 所有名称都查不到时清掉缓存，并向订阅者推送空列表
    fn vanish(&self, key: &ServiceKey) {
        if self.cache.remove(key).is_none() {
            return;
        }
        let version = self.next_version(key);
        info!("Service {} has no instances left", key);
        let list = Arc::new(ServiceList::new(version, key.origin_name.clone(), Vec::new()));
        self.notify(key, &list);
    }

    /// 注册中心故障时依次使用内存缓存和本地快照
    async fn recover(&self, key: &ServiceKey, err: Error) -> Result<Arc<ServiceList>> {
        if let Some(list) = self.cache.get(key).map(|entry| entry.list.clone()) {
            if !list.is_empty() {
                warn!("Registry failed for {} ({}), serving cached list", key, err);
                return Ok(Arc::new((*list).clone().with_run_mode(RunMode::Recover)));
            }
        }

        match self.store.load(key).await {
            Ok(Some(services)) if !services.is_empty() => {
                warn!("Registry failed for {} ({}), recovering from snapshot", key, err);
                let name = services[0].name.clone();
                let version = self.next_version(key);
                let list = Arc::new(
                    ServiceList::new(version, name, services).with_run_mode(RunMode::Recover),
                );
                // 立即过期，下一次解析仍然先访问注册中心
                self.cache.insert(
                    key.clone(),
                    CacheEntry {
                        list: list.clone(),
                        expires_at: Instant::now(),
                    },
                );
                self.notify(key, &list);
                Ok(list)
            }
            Ok(_) => Err(err),
            Err(load_err) => {
                warn!("Failed to load snapshot for {}: {}", key, load_err);
                Err(err)
            }
        }
    }

    fn republish(&self, key: &ServiceKey) {
        let Some(cached) = self.cache.get(key).map(|entry| entry.list.clone()) else {
            return;
        };
        let mut list = (*cached).clone();
        list.version = self.next_version(key);
        let list = Arc::new(list);
        if let Some(mut entry) = self.cache.get_mut(key) {
            entry.list = list.clone();
        }
        self.notify(key, &list);
    }

    fn notify(&self, key: &ServiceKey, list: &Arc<ServiceList>) {
        let Some(state) = self.watches.get(key).map(|state| state.clone()) else {
            return;
        };
        state.backoff.record(Instant::now());
        for watcher in state.watchers.read().iter() {
            watcher.handle(key, list.clone());
        }
    }

    /// 轮询一个键，变更越频繁下一次轮询越晚
    async fn poll(self: Arc<Self>, state: Arc<WatchState>) {
        info!("Watching service {} (preferred name {})", state.key, state.key.name);
        loop {
            let delay = self.options.watch_interval + state.backoff.delay();
            tokio::select! {
                _ = state.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let key = state.key.clone();
            if self.held.contains(&key) {
                debug!("Service {} is held, skipping registry", key);
                continue;
            }
            let before = self.versions.get(&key).map(|v| *v).unwrap_or(0);
            let inner = self.clone();
            let owned = key.clone();
            let preferred = Some(key.name.clone());
            match self
                .coalescer
                .run(key.clone(), move || inner.fetch(owned, preferred))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => debug!("Service {} not found while watching", key),
                Err(e) => warn!("Failed to refresh service {}: {}", key, e),
            }

            let after = self.versions.get(&key).map(|v| *v).unwrap_or(0);
            if after == before {
                state.backoff.relax();
            }
        }
        debug!("Stopped watching service {}", state.key);
    }
}

#[async_trait]
impl Discovery for Resolver {
    async fn resolve(&self, key: &mut ServiceKey) -> Result<Arc<ServiceList>> {
        Resolver::resolve(self, key).await
    }

    async fn watch(&self, key: &ServiceKey, watcher: Arc<dyn Watcher>) -> Result<()> {
        Resolver::watch(self, key, watcher)
    }

    async fn unwatch(&self, key: &ServiceKey, watcher: &Arc<dyn Watcher>) -> bool {
        Resolver::unwatch(self, key, watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{FileStore, MemoryStore};
    use common::service_register_center::MemoryRegistry;
    use parking_lot::Mutex;

    fn resolver_with(backend: Arc<MemoryRegistry>, store: Arc<dyn SnapshotStore>, ttl: Duration) -> Resolver {
        let options = ResolverOptions {
            cache_ttl: ttl,
            watch_interval: Duration::from_millis(100),
            churn: ChurnConfig::default(),
        };
        Resolver::new(backend, store, options)
    }

    fn key() -> ServiceKey {
        ServiceKey::new("user", "http", "prod")
    }

    #[derive(Default)]
    struct Recorder {
        versions: Mutex<Vec<u64>>,
        sizes: Mutex<Vec<usize>>,
    }

    impl Watcher for Recorder {
        fn handle(&self, _key: &ServiceKey, list: Arc<ServiceList>) {
            self.versions.lock().push(list.version);
            self.sizes.lock().push(list.services.len());
        }
    }

    #[tokio::test]
    async fn legacy_tier_resolves_and_updates_key_name() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::from_secs(5));

        let mut key = key();
        let services = resolver.lookup(&mut key).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(key.name, "user-http");
        // 标准名未命中后才尝试旧名
        assert_eq!(backend.lookup_count(), 2);
    }

    #[tokio::test]
    async fn standard_name_wins_over_origin() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user", "10.0.0.1", 8080));
        backend.insert(Service::new("user-http-prod", "10.0.0.2", 8080));
        let resolver = resolver_with(backend, Arc::new(MemoryStore::default()), Duration::from_secs(5));

        let mut key = key();
        let services = resolver.lookup(&mut key).await.unwrap();
        assert_eq!(services[0].ip, "10.0.0.2");
        assert_eq!(key.name, "user-http-prod");
    }

    #[tokio::test]
    async fn not_found_after_all_tiers() {
        let backend = Arc::new(MemoryRegistry::new());
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::from_secs(5));

        let err = resolver.lookup(&mut key()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(backend.lookup_count(), 3);
    }

    #[tokio::test]
    async fn other_errors_abort_without_trying_next_tier() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user", "10.0.0.1", 8080));
        backend.set_available(false);
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::from_secs(5));

        let err = resolver.lookup(&mut key()).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
        assert_eq!(backend.lookup_count(), 1);
    }

    #[tokio::test]
    async fn fresh_cache_skips_backend() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http-prod", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::from_secs(60));

        let mut first = key();
        resolver.lookup(&mut first).await.unwrap();
        let mut second = key();
        resolver.lookup(&mut second).await.unwrap();
        assert_eq!(backend.lookup_count(), 1);
        assert_eq!(second.name, "user-http-prod");
        assert_eq!(resolver.version(&second), 1);
    }

    #[tokio::test]
    async fn unchanged_instances_keep_version() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http-prod", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::ZERO);

        let first = resolver.resolve(&mut key()).await.unwrap();
        let second = resolver.resolve(&mut key()).await.unwrap();
        assert_eq!(first.version, second.version);

        backend.insert(Service::new("user-http-prod", "10.0.0.2", 8080));
        let third = resolver.resolve(&mut key()).await.unwrap();
        assert_eq!(third.version, first.version + 1);
        assert_eq!(third.services.len(), 2);
    }

    #[tokio::test]
    async fn registry_failure_serves_memory_cache() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http-prod", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::ZERO);

        resolver.resolve(&mut key()).await.unwrap();
        backend.set_available(false);
        let list = resolver.resolve(&mut key()).await.unwrap();
        assert_eq!(list.run_mode, RunMode::Recover);
        assert_eq!(list.services[0].ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn cold_start_recovers_from_file_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path())
            .store(&key(), &[Service::new("user-http", "10.0.0.7", 8080)])
            .await
            .unwrap();

        let backend = Arc::new(MemoryRegistry::new());
        backend.set_available(false);
        let resolver = resolver_with(backend, Arc::new(FileStore::new(dir.path())), Duration::from_secs(5));

        let mut key = key();
        let list = resolver.resolve(&mut key).await.unwrap();
        assert_eq!(list.run_mode, RunMode::Recover);
        assert_eq!(list.services[0].ip, "10.0.0.7");
        assert_eq!(key.name, "user-http");
    }

    #[tokio::test]
    async fn successful_lookups_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http-prod", "10.0.0.1", 8080));
        let resolver = resolver_with(backend, Arc::new(FileStore::new(dir.path())), Duration::from_secs(5));
        resolver.resolve(&mut key()).await.unwrap();

        let stored = FileStore::new(dir.path()).load(&key()).await.unwrap().unwrap();
        assert_eq!(stored[0].ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn register_writes_both_names() {
        let backend = Arc::new(MemoryRegistry::new());
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::from_secs(5));
        let opts = RegisterOptions {
            protocol: "http".to_string(),
            env: "prod".to_string(),
        };
        let service = Service::new("user", "10.0.0.1", 8080);

        resolver.register(&service, &opts).await.unwrap();
        assert!(backend.lookup("user-http", "", &[]).await.is_ok());
        assert!(backend.lookup("user-http-prod", "", &[]).await.is_ok());

        resolver.deregister(&service, &opts).await.unwrap();
        assert!(backend.lookup("user-http", "", &[]).await.is_err());
        assert!(backend.lookup("user-http-prod", "", &[]).await.is_err());

        let invalid = Service::new("user", "10.0.0.1", 8080).with_weight(-1);
        assert!(matches!(
            resolver.register(&invalid, &opts).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    /// 第二次注册失败的后端
    #[derive(Debug)]
    struct FlakyRegistry {
        inner: MemoryRegistry,
        registered: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ServiceRegister for FlakyRegistry {
        async fn register(&self, service: &Service) -> Result<String> {
            if self.registered.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                return Err(Error::Registry("register rejected".to_string()));
            }
            self.inner.register(service).await
        }

        async fn deregister(&self, service_id: &str) -> Result<()> {
            self.inner.deregister(service_id).await
        }

        async fn lookup(&self, name: &str, dc: &str, tags: &[String]) -> Result<Vec<Service>> {
            self.inner.lookup(name, dc, tags).await
        }
    }

    #[tokio::test]
    async fn failed_second_registration_keeps_the_first() {
        let backend = Arc::new(FlakyRegistry {
            inner: MemoryRegistry::new(),
            registered: Default::default(),
        });
        let options = ResolverOptions {
            cache_ttl: Duration::from_secs(5),
            ..Default::default()
        };
        let resolver = Resolver::new(backend.clone(), Arc::new(MemoryStore::default()), options);
        let opts = RegisterOptions {
            protocol: "http".to_string(),
            env: "prod".to_string(),
        };
        let service = Service::new("user", "10.0.0.1", 8080);

        let err = resolver.register(&service, &opts).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
        // 旧命名已写入且没有回滚，标准命名缺失
        assert!(backend.lookup("user-http", "", &[]).await.is_ok());
        assert!(backend.lookup("user-http-prod", "", &[]).await.unwrap_err().is_not_found());

        // 调用方负责清理
        resolver.deregister(&service, &opts).await.ok();
        assert!(backend.lookup("user-http", "", &[]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unwatch_last_watcher_stops_polling() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::ZERO);

        let mut key = key();
        resolver.resolve(&mut key).await.unwrap();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let first_watcher: Arc<dyn Watcher> = first.clone();
        let second_watcher: Arc<dyn Watcher> = second.clone();
        resolver.watch(&key, first_watcher.clone()).unwrap();
        resolver.watch(&key, second_watcher.clone()).unwrap();
        assert_eq!(resolver.watcher_count(&key), 2);

        assert!(resolver.unwatch(&key, &first_watcher));
        assert!(!resolver.unwatch(&key, &first_watcher));
        backend.insert(Service::new("user-http", "10.0.0.2", 8080));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(first.sizes.lock().as_slice(), &[1]);
        assert_eq!(second.sizes.lock().last(), Some(&2));

        assert!(resolver.unwatch(&key, &second_watcher));
        assert_eq!(resolver.watcher_count(&key), 0);
        let looked_up = backend.lookup_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.lookup_count(), looked_up);
    }

    #[tokio::test(start_paused = true)]
    async fn held_key_skips_registry_until_released() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::ZERO);

        let mut key = key();
        resolver.resolve(&mut key).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        resolver.watch(&key, recorder.clone()).unwrap();

        resolver.hold(&key);
        let looked_up = backend.lookup_count();
        backend.remove_name("user-http");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.lookup_count(), looked_up);
        assert_eq!(recorder.sizes.lock().as_slice(), &[1]);

        // 释放时以新版本重推缓存，随后的轮询再发现实例已消失
        let version = resolver.version(&key);
        resolver.release(&key);
        assert!(!resolver.is_held(&key));
        assert_eq!(recorder.versions.lock().last(), Some(&(version + 1)));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.sizes.lock().last(), Some(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_pushes_changes_in_version_order() {
        let backend = Arc::new(MemoryRegistry::new());
        backend.insert(Service::new("user-http", "10.0.0.1", 8080));
        let resolver = resolver_with(backend.clone(), Arc::new(MemoryStore::default()), Duration::ZERO);

        let mut key = key();
        resolver.resolve(&mut key).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        resolver.watch(&key, recorder.clone()).unwrap();
        assert_eq!(recorder.versions.lock().as_slice(), &[1]);

        backend.insert(Service::new("user-http", "10.0.0.2", 8080));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(recorder.versions.lock().last(), Some(&2));
        assert_eq!(recorder.sizes.lock().last(), Some(&2));

        // 实例全部消失时推送空列表
        backend.remove_name("user-http");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.sizes.lock().last(), Some(&0));

        resolver.close().await.unwrap();
        assert!(matches!(
            resolver.watch(&key, recorder.clone()),
            Err(Error::Cancelled)
        ));
    }
}
