//! 自我保护
//!
//! 每个被访问过的键都有一个 `WatchKey`。后台任务定期向快照源询问该键是否需要降级；
//! 降级期间的解析直接使用快照，不再访问注册中心，直到快照源解除标记。
//! 长期未访问的键由清理任务移除，清理以合并器的在途表为准，在途的键不会被移除。
//! 经由这里订阅的 watch 在降级期间只收到快照，解析器对该键的轮询同时暂停。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use common::coalescer::Coalescer;
use common::configs::SelfProtectionConfig;
use common::service_register_center::typos::{RunMode, ServiceKey, ServiceList};
use common::{Error, Result};

use crate::resolver::Resolver;
use crate::source::{SnapshotSource, SourceSnapshot};
use crate::{Discovery, Watcher};

/// 一个订阅者和挂在解析器上替它把关的 gate
struct Subscription {
    watcher: Arc<dyn Watcher>,
    gate: Arc<dyn Watcher>,
}

/// 自我保护中被观察的键
pub struct WatchKey {
    key: ServiceKey,
    last_access: Mutex<Instant>,
    /// true 表示注册中心被判定为不可靠，改用快照
    enabled: AtomicBool,
    snapshot: ArcSwapOption<ServiceList>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl fmt::Debug for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchKey")
            .field("key", &self.key)
            .field("enabled", &self.is_enabled())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl WatchKey {
    fn new(key: ServiceKey) -> Self {
        Self {
            key,
            last_access: Mutex::new(Instant::now()),
            enabled: AtomicBool::new(false),
            snapshot: ArcSwapOption::empty(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    fn has_subscribers(&self) -> bool {
        !self.subscriptions.read().is_empty()
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

struct Inner {
    resolver: Resolver,
    source: Arc<dyn SnapshotSource>,
    fetch_interval: Duration,
    clean_interval: Duration,
    keys: DashMap<ServiceKey, Arc<WatchKey>>,
    coalescer: Coalescer<ServiceKey, SourceSnapshot>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

/// 自我保护降级控制器
#[derive(Clone)]
pub struct SelfProtection {
    inner: Arc<Inner>,
}

impl SelfProtection {
    pub fn new(resolver: Resolver, source: Arc<dyn SnapshotSource>, config: &SelfProtectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                source,
                fetch_interval: config.fetch_interval(),
                clean_interval: config.clean_interval(),
                keys: DashMap::new(),
                coalescer: Coalescer::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// 启动拉取和清理两个后台任务
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::Acquire) {
            warn!("Self protection already stopped, not starting");
            return;
        }
        info!(
            "Starting self protection (fetch every {:?}, clean after {:?})",
            self.inner.fetch_interval, self.inner.clean_interval
        );
        self.inner.tracker.spawn(Inner::fetch_loop(self.inner.clone()));
        self.inner.tracker.spawn(Inner::clean_loop(self.inner.clone()));
    }

    /// 停止后台任务并等待退出，可以重复调用
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Self protection stopped");
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    pub fn watch_key(&self, key: &ServiceKey) -> Option<Arc<WatchKey>> {
        self.inner.keys.get(key).map(|entry| entry.clone())
    }

    pub fn is_degraded(&self, key: &ServiceKey) -> bool {
        self.watch_key(key).is_some_and(|wk| wk.is_enabled())
    }

    /// 立即向快照源拉取一次，并发的调用合并为一次
    pub async fn refresh(&self, key: &ServiceKey) -> Result<()> {
        let wk = self.inner.track(key);
        self.inner.clone().refresh(wk).await
    }

    /// 解析实例列表
    ///
    /// 降级中的键返回快照，没有可用快照时回到正常解析，降级本身不会作为错误返回
    pub async fn resolve(&self, key: &mut ServiceKey) -> Result<Arc<ServiceList>> {
        let wk = match self.inner.keys.get(key).map(|entry| entry.clone()) {
            Some(wk) => {
                wk.touch();
                wk
            }
            None => {
                // 首次访问时在后台拉一次，不阻塞本次解析
                let wk = self.inner.track(key);
                let inner = self.inner.clone();
                let pending = wk.clone();
                self.inner.tracker.spawn(async move {
                    if let Err(e) = inner.refresh(pending).await {
                        debug!("Initial snapshot fetch failed: {}", e);
                    }
                });
                wk
            }
        };

        if wk.is_enabled() {
            match self.inner.degraded_list(&wk) {
                Ok(list) => {
                    key.name = list.name.clone();
                    return Ok(list);
                }
                Err(e) => debug!("{}, resolving from registry", e),
            }
        }
        self.inner.resolver.resolve(key).await
    }

    /// 订阅键的变更，降级期间解析器的推送被丢弃，改为推送快照
    pub fn watch(&self, key: &ServiceKey, watcher: Arc<dyn Watcher>) -> Result<()> {
        // 在分片锁内登记订阅，清理任务不会在这期间移除该键
        let (wk, gate) = {
            let entry = self
                .inner
                .keys
                .entry(key.clone())
                .or_insert_with(|| Arc::new(WatchKey::new(key.clone())));
            let wk = entry.value().clone();
            let gate: Arc<dyn Watcher> = Arc::new(DegradeGate {
                wk: Arc::downgrade(&wk),
                watcher: watcher.clone(),
            });
            wk.subscriptions.write().push(Subscription {
                watcher: watcher.clone(),
                gate: gate.clone(),
            });
            (wk, gate)
        };
        wk.touch();

        if let Err(e) = self.inner.resolver.watch(key, gate.clone()) {
            wk.subscriptions
                .write()
                .retain(|sub| !Arc::ptr_eq(&sub.gate, &gate));
            return Err(e);
        }

        if wk.is_enabled() {
            if let Some(list) = self.inner.versioned_degraded_list(&wk) {
                watcher.handle(key, list);
            }
        }
        Ok(())
    }

    /// 退订 `watch` 登记的订阅者
    pub fn unwatch(&self, key: &ServiceKey, watcher: &Arc<dyn Watcher>) -> bool {
        let Some(wk) = self.watch_key(key) else {
            return false;
        };
        let gate = {
            let mut subscriptions = wk.subscriptions.write();
            subscriptions
                .iter()
                .position(|sub| Arc::ptr_eq(&sub.watcher, watcher))
                .map(|pos| subscriptions.remove(pos).gate)
        };
        match gate {
            Some(gate) => self.inner.resolver.unwatch(key, &gate),
            None => false,
        }
    }
}

/// 挂在解析器上的订阅者，键降级期间丢弃注册中心的推送
struct DegradeGate {
    wk: Weak<WatchKey>,
    watcher: Arc<dyn Watcher>,
}

impl Watcher for DegradeGate {
    fn handle(&self, key: &ServiceKey, list: Arc<ServiceList>) {
        if self.wk.upgrade().is_some_and(|wk| wk.is_enabled()) {
            debug!("Dropping registry push for {} while degraded", key);
            return;
        }
        self.watcher.handle(key, list);
    }
}

impl Inner {
    /// 降级时使用的列表：快照源给出的实例优先，其次是解析器的最近缓存
    fn degraded_list(&self, wk: &WatchKey) -> Result<Arc<ServiceList>> {
        if let Some(snapshot) = wk.snapshot.load_full() {
            if !snapshot.is_empty() {
                return Ok(snapshot);
            }
        }
        match self.resolver.cached(&wk.key) {
            Some(list) if !list.is_empty() => Ok(Arc::new(
                (*list).clone().with_run_mode(RunMode::SelfProtection),
            )),
            _ => Err(Error::Degraded(format!("{} 没有可用的降级快照", wk.key))),
        }
    }

    /// 降级列表的副本，版本号排在解析器已经推送过的所有版本之后
    fn versioned_degraded_list(&self, wk: &WatchKey) -> Option<Arc<ServiceList>> {
        let list = self.degraded_list(wk).ok()?;
        let mut list = (*list).clone();
        list.version = self.resolver.next_version(&wk.key);
        Some(Arc::new(list))
    }

    fn push_degraded(&self, wk: &WatchKey) {
        let watchers: Vec<Arc<dyn Watcher>> = wk
            .subscriptions
            .read()
            .iter()
            .map(|sub| sub.watcher.clone())
            .collect();
        if watchers.is_empty() {
            return;
        }
        let Some(list) = self.versioned_degraded_list(wk) else {
            debug!("No degraded list to push for {}", wk.key);
            return;
        };
        debug!("Pushing degraded list version {} for {}", list.version, wk.key);
        for watcher in watchers {
            watcher.handle(&wk.key, list.clone());
        }
    }

    fn track(&self, key: &ServiceKey) -> Arc<WatchKey> {
        let wk = self
            .keys
            .entry(key.clone())
            .or_insert_with(|| Arc::new(WatchKey::new(key.clone())))
            .clone();
        wk.touch();
        wk
    }

    async fn refresh(self: Arc<Self>, wk: Arc<WatchKey>) -> Result<()> {
        let source = self.source.clone();
        let key = wk.key.clone();
        let snapshot = self
            .coalescer
            .run(wk.key.clone(), move || async move { source.fetch(&key).await })
            .await?;

        let changed = match wk.snapshot.load_full() {
            Some(previous) => !previous.same_instances(&snapshot.services),
            None => !snapshot.services.is_empty(),
        };
        if snapshot.services.is_empty() {
            wk.snapshot.store(None);
        } else if changed {
            let version = self.resolver.version(&wk.key);
            let name = snapshot.services[0].name.clone();
            let list = ServiceList::new(version, name, snapshot.services)
                .with_run_mode(RunMode::SelfProtection);
            wk.snapshot.store(Some(Arc::new(list)));
        }

        // 先切换标记再暂停轮询，此后到达的注册中心推送都会被 gate 丢弃
        let was_enabled = wk.enabled.swap(snapshot.use_sentinel, Ordering::AcqRel);
        if snapshot.use_sentinel {
            self.resolver.hold(&wk.key);
            if !was_enabled {
                warn!("Service {} entering self protection", wk.key);
            }
            if !was_enabled || changed {
                self.push_degraded(&wk);
            }
        } else if was_enabled {
            info!("Service {} leaving self protection", wk.key);
            self.resolver.release(&wk.key);
        }
        Ok(())
    }

    async fn fetch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.fetch_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let keys: Vec<Arc<WatchKey>> = self.keys.iter().map(|entry| entry.value().clone()).collect();
            debug!("Refreshing {} self protection keys", keys.len());
            let results = join_all(keys.into_iter().map(|wk| {
                let inner = self.clone();
                async move {
                    let key = wk.key.clone();
                    (key, inner.refresh(wk).await)
                }
            }))
            .await;
            for (key, result) in results {
                if let Err(e) = result {
                    error!("Failed to fetch snapshot for {}: {}", key, e);
                }
            }
        }
    }

    async fn clean_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.clean_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.clean(Instant::now());
        }
    }

    /// 移除空闲超时、没有订阅者且没有在途拉取的键
    fn clean(&self, now: Instant) -> usize {
        let mut evicted = Vec::new();
        self.keys.retain(|key, wk| {
            let idle = now.saturating_duration_since(wk.last_access()) >= self.clean_interval;
            let keep = !idle || wk.has_subscribers() || self.coalescer.in_flight(key);
            if !keep {
                evicted.push(key.clone());
            }
            keep
        });
        for key in &evicted {
            self.resolver.release(key);
        }
        if !evicted.is_empty() {
            debug!("Evicted {} idle self protection keys", evicted.len());
        }
        evicted.len()
    }
}

#[async_trait]
impl Discovery for SelfProtection {
    async fn resolve(&self, key: &mut ServiceKey) -> Result<Arc<ServiceList>> {
        SelfProtection::resolve(self, key).await
    }

    async fn watch(&self, key: &ServiceKey, watcher: Arc<dyn Watcher>) -> Result<()> {
        SelfProtection::watch(self, key, watcher)
    }

    async fn unwatch(&self, key: &ServiceKey, watcher: &Arc<dyn Watcher>) -> bool {
        SelfProtection::unwatch(self, key, watcher)
    }
}
