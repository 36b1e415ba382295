use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use balancer::{
    Balancer, BalancerWatcher, BlackWhiteList, LoadBalancer, PickOptions, PickerBuilders, Sticky,
};
use circuit_breaker::{BreakerSet, CircuitBreakerPanel};
use common::config::{AppConfig, SharedConfig};
use common::configs::{BlackWhiteListConfig, LoadBalancingConfig, CONSUMER};
use common::invocation::Invocation;
use common::service_register_center::typos::ServiceKey;
use common::{Error, Result};
use registry::{Discovery, Watcher};

use crate::backoff::RetryBackoff;
use crate::transport::{Response, Transport};

/// 经 sidecar 转发时携带目标服务名的元数据键
pub const TARGET_SERVICE_HEADER: &str = "x-mesh-target-service";

/// 一个解析键当前使用的负载均衡器，配置版本或策略变化时整体替换
struct BalancerEntry {
    config_version: u64,
    strategy: String,
    balancer: Arc<dyn LoadBalancer>,
    guard: Option<Arc<BlackWhiteList>>,
    watcher: Arc<dyn Watcher>,
}

impl BalancerEntry {
    fn serves(&self, config_version: u64, strategy: &str) -> bool {
        self.config_version == config_version && self.strategy == strategy
    }
}

struct RetryPlan {
    same: u32,
    next: u32,
    backoff: RetryBackoff,
}

impl RetryPlan {
    fn new(config: &LoadBalancingConfig) -> Self {
        let (same, next) = if config.retry_enabled {
            (config.retry_on_same, config.retry_on_next)
        } else {
            (0, 0)
        };
        Self {
            same,
            next,
            backoff: RetryBackoff::new(&config.backoff),
        }
    }
}

/// 调用编排器
///
/// 一次调用依次经过：是否绕过服务发现、解析、负载均衡选择、熔断判断、传输、失败重试。
/// 每个挂起点都响应取消。
pub struct Invoker {
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    config: Arc<SharedConfig>,
    builders: Arc<PickerBuilders>,
    breakers: BreakerSet,
    balancers: DashMap<ServiceKey, Arc<BalancerEntry>>,
    /// 目标名是否按直连主机处理，按目标缓存
    direct: DashMap<String, bool>,
}

impl Invoker {
    pub fn new(discovery: Arc<dyn Discovery>, transport: Arc<dyn Transport>, config: Arc<SharedConfig>) -> Self {
        let panel = Arc::new(CircuitBreakerPanel::from_shared(&config));
        Self {
            discovery,
            transport,
            config,
            builders: Arc::new(PickerBuilders::new()),
            breakers: BreakerSet::new(panel),
            balancers: DashMap::new(),
            direct: DashMap::new(),
        }
    }

    /// 使用自定义的选择器构建函数集合
    pub fn with_builders(mut self, builders: Arc<PickerBuilders>) -> Self {
        self.builders = builders;
        self
    }

    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    /// 目标名含 "." 时视为直连主机，结果按目标缓存
    pub fn is_direct_host(&self, target: &str) -> bool {
        if let Some(hit) = self.direct.get(target) {
            return *hit;
        }
        let direct = target.contains('.');
        self.direct.insert(target.to_string(), direct);
        direct
    }

    pub async fn invoke(&self, inv: &Invocation, cancel: &CancellationToken) -> Result<Response> {
        if cancel.is_cancelled() {
            debug!("Invocation of {} cancelled before start", inv.microservice_name);
            return Err(Error::Cancelled);
        }
        self.breakers.panel().sync(&self.config);
        let version = self.config.version();
        let config = self.config.load();

        let call = self.dispatch(inv, &config, version, cancel);
        match inv.timeout.or_else(|| config.invoker.timeout()) {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Invocation of {} timed out after {:?}", inv.microservice_name, limit);
                    Err(Error::timeout(limit))
                }
            },
            None => call.await,
        }
    }

    /// 停止所有黑白名单心跳，退订并丢弃负载均衡器
    pub async fn close(&self) {
        let keys: Vec<ServiceKey> = self.balancers.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((key, entry)) = self.balancers.remove(&key) {
                self.retire(&key, &entry).await;
            }
        }
        info!("Invoker closed");
    }

    /// 当前缓存的负载均衡器数量
    pub fn balancer_count(&self) -> usize {
        self.balancers.len()
    }

    async fn dispatch(
        &self,
        inv: &Invocation,
        config: &AppConfig,
        config_version: u64,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let lb = config.load_balancing.for_service(&inv.microservice_name);
        let plan = RetryPlan::new(lb);

        if let Some(endpoint) = inv.endpoint.as_ref().filter(|e| !e.is_empty()) {
            debug!("Calling {} directly at {}", inv.microservice_name, endpoint);
            return self.call_direct(inv, endpoint, &plan, cancel).await;
        }
        if let Some(sidecar) = config.invoker.sidecar_address.as_ref().filter(|s| !s.is_empty()) {
            debug!("Routing {} through sidecar {}", inv.microservice_name, sidecar);
            let routed = inv
                .clone()
                .with_metadata(TARGET_SERVICE_HEADER, inv.microservice_name.clone());
            return self.call_direct(&routed, sidecar, &plan, cancel).await;
        }
        if self.is_direct_host(&inv.microservice_name) {
            return self.call_direct(inv, &inv.microservice_name, &plan, cancel).await;
        }

        let mut key = inv.service_key(&config.invoker.protocol, &config.registry.env);
        if key.dc.is_empty() {
            key.dc = config.registry.dc.clone();
        }
        let strategy = inv.strategy.as_deref().unwrap_or(lb.strategy.as_str());
        let balancer = self
            .balancer_for(
                &mut key,
                strategy,
                lb,
                &config.load_balancing.black_white_list,
                config_version,
                cancel,
            )
            .await?;
        self.call_balanced(inv, balancer.as_ref(), &plan, cancel).await
    }

    /// 按键懒加载负载均衡器并挂到服务发现的 watch 上
    ///
    /// 配置版本或策略与现有的不一致时重建，被替换的那个停止心跳并退订
    async fn balancer_for(
        &self,
        key: &mut ServiceKey,
        strategy: &str,
        lb: &LoadBalancingConfig,
        bw: &BlackWhiteListConfig,
        config_version: u64,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn LoadBalancer>> {
        if let Some(entry) = self.balancers.get(&*key) {
            if entry.serves(config_version, strategy) {
                return Ok(entry.balancer.clone());
            }
        }

        // 解析可能访问注册中心，和取消信号赛跑
        let list = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.discovery.resolve(key) => result?,
        };
        let base = Balancer::new(strategy, &self.builders)?;
        base.update(list);
        let mut balancer: Arc<dyn LoadBalancer> = Arc::new(base);
        let mut guard = None;
        if bw.enabled {
            let wrapped = Arc::new(BlackWhiteList::with_tcp(balancer, bw));
            guard = Some(wrapped.clone());
            balancer = wrapped;
        }
        if let Some(window) = lb.stickiness() {
            balancer = Arc::new(Sticky::new(balancer, window));
        }

        let entry = Arc::new(BalancerEntry {
            config_version,
            strategy: strategy.to_string(),
            balancer: balancer.clone(),
            guard,
            watcher: Arc::new(BalancerWatcher(balancer.clone())),
        });

        // 并发创建时保留已插入的同版本实例，后来者的装饰器随之丢弃
        let replaced = match self.balancers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.serves(config_version, strategy) || current.config_version > config_version {
                    return Ok(current.balancer.clone());
                }
                Some(occupied.insert(entry.clone()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                None
            }
        };
        if let Some(guard) = &entry.guard {
            guard.spawn();
        }
        if let Err(err) = self.discovery.watch(key, entry.watcher.clone()).await {
            warn!("Failed to watch {}: {}", key.origin_name, err);
        }
        if let Some(replaced) = replaced {
            info!(
                "Replacing balancer ({}, config version {}) for {}",
                replaced.strategy, replaced.config_version, key.origin_name
            );
            self.retire(key, &replaced).await;
        }
        info!("Balancer ({}) created for {} as {}", strategy, key.origin_name, key.name);
        Ok(balancer)
    }

    /// 停止被替换的负载均衡器：心跳退出，不再接收推送
    async fn retire(&self, key: &ServiceKey, entry: &BalancerEntry) {
        if let Some(guard) = &entry.guard {
            guard.stop();
        }
        if !self.discovery.unwatch(key, &entry.watcher).await {
            debug!("Balancer for {} was not watching", key.origin_name);
        }
    }

    async fn call_direct(
        &self,
        inv: &Invocation,
        endpoint: &str,
        plan: &RetryPlan,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut retry = 0;
        loop {
            match self.call_once(inv, endpoint, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && retry < plan.same => {
                    warn!("Call to {} failed, retrying: {}", endpoint, err);
                    self.pause(plan.backoff.delay(retry), cancel).await?;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// 每个实例最多尝试 `same + 1` 次，最多换 `next` 次实例；
    /// 连接失败的实例报告给黑白名单并立即换下一个
    async fn call_balanced(
        &self,
        inv: &Invocation,
        balancer: &dyn LoadBalancer,
        plan: &RetryPlan,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let opts = PickOptions {
            session_id: inv.session_id.as_deref(),
        };
        let mut retry = 0u32;
        let mut last = None;
        for _ in 0..=plan.next {
            let service = balancer.pick(&opts)?;
            let endpoint = service.address();
            for _ in 0..=plan.same {
                if retry > 0 {
                    self.pause(plan.backoff.delay(retry - 1), cancel).await?;
                }
                retry += 1;
                match self.call_once(inv, &endpoint, cancel).await {
                    Ok(response) => return Ok(response),
                    Err(err) if !err.is_retryable() => return Err(err),
                    Err(err) => {
                        warn!(
                            "Call to {} at {} failed (attempt {}): {}",
                            inv.microservice_name, endpoint, retry, err
                        );
                        let unavailable = matches!(err, Error::Unavailable(_));
                        last = Some(err);
                        if unavailable {
                            balancer.report_failure(&service);
                            break;
                        }
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Internal(format!("{} 没有完成任何尝试", inv.microservice_name))))
    }

    /// 单次传输，和取消信号赛跑，输的一方直接丢弃
    async fn call_once(&self, inv: &Invocation, endpoint: &str, cancel: &CancellationToken) -> Result<Response> {
        let permit = self.breakers.acquire(inv, CONSUMER)?;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.transport.call(endpoint, inv) => result,
        };
        match &result {
            Ok(_) => permit.success(),
            Err(Error::Cancelled) => drop(permit),
            Err(_) => permit.failure(),
        }
        result
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        if delay.is_zero() {
            return if cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            };
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Drop for Invoker {
    fn drop(&mut self) {
        for entry in self.balancers.iter() {
            if let Some(guard) = &entry.guard {
                guard.stop();
            }
        }
    }
}
