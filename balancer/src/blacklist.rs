//! 黑白名单
//!
//! 调用失败的实例被加入屏蔽集合，选择时跳过；后台心跳对每个被屏蔽的实例做一次 TCP 拨号，
//! 成功立即解除，失败累计次数，超过上限后同样解除，保证实例最终会被重新尝试。

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::configs::BlackWhiteListConfig;
use common::service_register_center::typos::{Service, ServiceKey, ServiceList};
use common::{Error, Result};

use crate::{LoadBalancer, PickOptions};

/// 实例探活
#[async_trait]
pub trait Prober: Send + Sync + Debug {
    async fn probe(&self, service: &Service) -> bool;
}

/// TCP 拨号探活
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, service: &Service) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(service.address())).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, Clone)]
struct Blocked {
    service: Service,
    misses: u32,
}

/// 黑白名单装饰器
pub struct BlackWhiteList {
    inner: Arc<dyn LoadBalancer>,
    blocked: Mutex<HashMap<String, Blocked>>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    max_misses: u32,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl BlackWhiteList {
    pub fn new(inner: Arc<dyn LoadBalancer>, prober: Arc<dyn Prober>, config: &BlackWhiteListConfig) -> Self {
        Self {
            inner,
            blocked: Mutex::new(HashMap::new()),
            prober,
            interval: config.interval(),
            max_misses: config.max_misses,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// 使用 TCP 探活
    pub fn with_tcp(inner: Arc<dyn LoadBalancer>, config: &BlackWhiteListConfig) -> Self {
        Self::new(inner, Arc::new(TcpProber::new(config.dial_timeout())), config)
    }

    pub fn block(&self, service: &Service) {
        let mut blocked = self.blocked.lock();
        if !blocked.contains_key(service.id()) {
            warn!("Blocking instance {} ({})", service.id(), service.address());
            blocked.insert(
                service.id().to_string(),
                Blocked {
                    service: service.clone(),
                    misses: 0,
                },
            );
        }
    }

    pub fn unblock(&self, service: &Service) -> bool {
        self.blocked.lock().remove(service.id()).is_some()
    }

    pub fn is_blocked(&self, service: &Service) -> bool {
        self.blocked.lock().contains_key(service.id())
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.lock().len()
    }

    /// 对所有被屏蔽的实例做一轮探活，返回本轮解除的数量
    ///
    /// 探活期间不持有锁
    pub async fn heartbeat(&self) -> usize {
        let targets: Vec<Service> = self
            .blocked
            .lock()
            .values()
            .map(|b| b.service.clone())
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let results = join_all(targets.iter().map(|service| self.prober.probe(service))).await;

        let mut released = 0;
        let mut blocked = self.blocked.lock();
        for (service, alive) in targets.iter().zip(results) {
            let release = match blocked.get_mut(service.id()) {
                None => continue,
                Some(_) if alive => {
                    info!("Instance {} is reachable again, unblocking", service.address());
                    true
                }
                Some(entry) => {
                    entry.misses += 1;
                    if entry.misses > self.max_misses {
                        warn!(
                            "Instance {} missed {} heartbeats, unblocking anyway",
                            service.address(),
                            entry.misses
                        );
                        true
                    } else {
                        false
                    }
                }
            };
            if release {
                blocked.remove(service.id());
                released += 1;
            }
        }
        released
    }

    /// 启动心跳任务，重复调用无效
    ///
    /// 任务只持有弱引用，最后一个强引用释放后由 `Drop` 取消
    pub fn spawn(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        let released = this.heartbeat().await;
                        if released > 0 {
                            debug!("Heartbeat released {} instances", released);
                        }
                    }
                }
            }
            debug!("Black/white list heartbeat stopped");
        });
    }

    /// 停止心跳任务，可以重复调用
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl LoadBalancer for BlackWhiteList {
    /// 最多尝试屏蔽集合大小加一次，全部命中屏蔽时返回 NotFound
    fn pick(&self, opts: &PickOptions<'_>) -> Result<Service> {
        let attempts = self.blocked_len() + 1;
        for _ in 0..attempts {
            let service = self.inner.pick(opts)?;
            if !self.is_blocked(&service) {
                return Ok(service);
            }
        }
        Err(Error::NotFound(format!(
            "{} 的实例全部被屏蔽",
            self.inner.snapshot().name
        )))
    }

    /// 新列表中已不存在的实例同时移出屏蔽集合
    fn handle(&self, key: &ServiceKey, list: Arc<ServiceList>) {
        self.inner.handle(key, list);
        let current = self.inner.snapshot();
        self.blocked
            .lock()
            .retain(|id, _| current.services.iter().any(|s| s.id() == id.as_str()));
    }

    fn snapshot(&self) -> Arc<ServiceList> {
        self.inner.snapshot()
    }

    fn available(&self, service: &Service) -> bool {
        !self.is_blocked(service) && self.inner.available(service)
    }

    fn report_failure(&self, service: &Service) {
        self.block(service);
        self.inner.report_failure(service);
    }
}

impl Drop for BlackWhiteList {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
