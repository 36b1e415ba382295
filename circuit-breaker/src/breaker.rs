//! 熔断状态机
//!
//! 每个 `{serviceType}:{serviceName}` 一个熔断器，阈值每次调用都从面板读取，
//! 配置热更新后立即生效。统计窗口为最近 10 秒。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use common::configs::CircuitBreakerConfig;
use common::invocation::Invocation;
use common::window::RollingWindow;
use common::{Error, Result};

use crate::panel::{scope_key, service_name, CircuitBreakerPanel};

/// 统计窗口秒数
const STATS_WINDOW_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    /// 半开状态下是否已有探测请求在途
    probing: bool,
    requests: RollingWindow,
    errors: RollingWindow,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            probing: false,
            requests: RollingWindow::new(STATS_WINDOW_SECS as usize),
            errors: RollingWindow::new(STATS_WINDOW_SECS as usize),
        }
    }
}

/// 单个熔断器
#[derive(Debug)]
pub struct Breaker {
    name: String,
    state: Mutex<BreakerState>,
    concurrent: AtomicU32,
}

impl Breaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BreakerState::new()),
            concurrent: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn concurrent(&self) -> u32 {
        self.concurrent.load(Ordering::Acquire)
    }

    /// 申请一次调用许可
    pub fn try_acquire(self: &Arc<Self>, config: &CircuitBreakerConfig, now: Instant) -> Result<Permit> {
        if !config.enabled {
            return Ok(Permit::noop());
        }
        if config.force_open {
            return Err(Error::CircuitOpen(format!("{} 被强制打开", self.name)));
        }

        let running = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        if running > config.max_concurrent_requests {
            self.concurrent.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::CircuitOpen(format!(
                "{} 并发请求数超过上限 {}",
                self.name, config.max_concurrent_requests
            )));
        }

        let probe = if config.force_closed {
            false
        } else {
            match self.admit(config.sleep_window(), now) {
                Ok(probe) => probe,
                Err(err) => {
                    self.concurrent.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        };

        Ok(Permit {
            breaker: Some(self.clone()),
            config: config.clone(),
            probe,
            settled: false,
        })
    }

    /// 返回本次调用是否是半开探测
    fn admit(&self, sleep_window: Duration, now: Instant) -> Result<bool> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(sleep_window);
                if elapsed >= sleep_window {
                    info!("Circuit {} half-open, letting one probe through", self.name);
                    state.state = CircuitState::HalfOpen;
                    state.probing = true;
                    Ok(true)
                } else {
                    Err(Error::CircuitOpen(format!(
                        "{} 熔断中, {}ms 后重试",
                        self.name,
                        (sleep_window - elapsed).as_millis()
                    )))
                }
            }
            CircuitState::HalfOpen if !state.probing => {
                state.probing = true;
                Ok(true)
            }
            CircuitState::HalfOpen => Err(Error::CircuitOpen(format!("{} 正在探测恢复", self.name))),
        }
    }

    fn record(&self, config: &CircuitBreakerConfig, probe: bool, failed: bool, now: Instant) {
        let mut state = self.state.lock();
        if probe {
            state.probing = false;
            if failed {
                warn!("Circuit {} probe failed, reopening", self.name);
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
            } else {
                info!("Circuit {} closed after successful probe", self.name);
                *state = BreakerState::new();
            }
            return;
        }

        state.requests.append(now);
        if failed {
            state.errors.append(now);
        }
        if config.force_closed || state.state != CircuitState::Closed || !failed {
            return;
        }

        let total = state.requests.count(now, STATS_WINDOW_SECS);
        let errors = state.errors.count(now, STATS_WINDOW_SECS);
        if total >= config.request_volume_threshold
            && total > 0
            && errors * 100 >= config.error_threshold_percentage * total
        {
            warn!(
                "Circuit {} opened: {}/{} requests failed in the last {}s",
                self.name, errors, total, STATS_WINDOW_SECS
            );
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
        }
    }

    /// 许可被丢弃而没有结论（例如调用被取消）
    fn abandon(&self, probe: bool) {
        if probe {
            self.state.lock().probing = false;
        }
    }
}

/// 一次调用的许可
///
/// 调用结束时用 `success` 或 `failure` 报告结果；直接丢弃不计入统计，
/// 半开探测名额会被释放给下一次调用
#[derive(Debug)]
pub struct Permit {
    breaker: Option<Arc<Breaker>>,
    config: CircuitBreakerConfig,
    probe: bool,
    settled: bool,
}

impl Permit {
    fn noop() -> Self {
        Self {
            breaker: None,
            config: CircuitBreakerConfig::default(),
            probe: false,
            settled: true,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(self) {
        self.settle(false, Instant::now());
    }

    pub fn failure(self) {
        self.settle(true, Instant::now());
    }

    pub fn settle(mut self, failed: bool, now: Instant) {
        if let Some(breaker) = &self.breaker {
            breaker.record(&self.config, self.probe, failed, now);
        }
        self.settled = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(breaker) = &self.breaker {
            breaker.concurrent.fetch_sub(1, Ordering::AcqRel);
            if !self.settled {
                breaker.abandon(self.probe);
            }
        }
    }
}

/// 按服务维护的熔断器集合
#[derive(Debug)]
pub struct BreakerSet {
    panel: Arc<CircuitBreakerPanel>,
    breakers: DashMap<String, Arc<Breaker>>,
}

impl BreakerSet {
    pub fn new(panel: Arc<CircuitBreakerPanel>) -> Self {
        Self {
            panel,
            breakers: DashMap::new(),
        }
    }

    pub fn panel(&self) -> &Arc<CircuitBreakerPanel> {
        &self.panel
    }

    pub fn breaker(&self, service_type: &str, service_name: &str) -> Arc<Breaker> {
        let key = scope_key(service_type, service_name);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Breaker::new(key)))
            .clone()
    }

    /// 按面板中的当前配置判断本次调用是否放行
    pub fn acquire(&self, inv: &Invocation, service_type: &str) -> Result<Permit> {
        let config = self.panel.get_circuit_breaker(inv, service_type);
        self.breaker(service_type, service_name(inv, service_type))
            .try_acquire(&config, Instant::now())
    }
}
