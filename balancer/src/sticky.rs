use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use common::service_register_center::typos::{Service, ServiceKey, ServiceList};
use common::Result;

use crate::{LoadBalancer, PickOptions};

/// 最多记住的会话数
const SESSION_CAPACITY: usize = 4096;

/// 会话粘滞
///
/// 同一个会话在窗口期内重复命中上一次选中的实例，实例下线或被屏蔽后重新选择
pub struct Sticky {
    inner: Arc<dyn LoadBalancer>,
    window: Duration,
    sessions: Mutex<LruCache<String, (Service, Instant)>>,
}

impl Sticky {
    pub fn new(inner: Arc<dyn LoadBalancer>, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(SESSION_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            window,
            sessions: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn remembered(&self, session: &str, now: Instant) -> Option<Service> {
        let (service, at) = self.sessions.lock().get(session).cloned()?;
        if now.saturating_duration_since(at) > self.window {
            return None;
        }
        let present = self
            .inner
            .snapshot()
            .services
            .iter()
            .any(|s| s.id() == service.id());
        (present && self.inner.available(&service)).then_some(service)
    }
}

impl LoadBalancer for Sticky {
    fn pick(&self, opts: &PickOptions<'_>) -> Result<Service> {
        let Some(session) = opts.session_id else {
            return self.inner.pick(opts);
        };
        let now = Instant::now();
        if let Some(service) = self.remembered(session, now) {
            debug!("Session {} sticks to {}", session, service.address());
            self.sessions.lock().put(session.to_string(), (service.clone(), now));
            return Ok(service);
        }
        let service = self.inner.pick(opts)?;
        self.sessions.lock().put(session.to_string(), (service.clone(), now));
        Ok(service)
    }

    fn handle(&self, key: &ServiceKey, list: Arc<ServiceList>) {
        self.inner.handle(key, list);
    }

    fn snapshot(&self) -> Arc<ServiceList> {
        self.inner.snapshot()
    }

    fn available(&self, service: &Service) -> bool {
        self.inner.available(service)
    }

    /// 指向失败实例的会话全部失效
    fn report_failure(&self, service: &Service) {
        let mut sessions = self.sessions.lock();
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, (s, _))| s.id() == service.id())
            .map(|(session, _)| session.clone())
            .collect();
        for session in stale {
            sessions.pop(&session);
        }
        drop(sessions);
        self.inner.report_failure(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::PickerBuilders;
    use crate::{Balancer, BlackWhiteList, TcpProber};
    use common::configs::{BlackWhiteListConfig, STRATEGY_ROUND_ROBIN};

    fn balancer() -> Arc<dyn LoadBalancer> {
        let balancer = Balancer::new(STRATEGY_ROUND_ROBIN, &PickerBuilders::new()).unwrap();
        let services = (1..=3)
            .map(|i| Service::new("user", format!("10.0.0.{}", i), 8080))
            .collect();
        balancer.update(Arc::new(ServiceList::new(1, "user", services)));
        Arc::new(balancer)
    }

    #[test]
    fn session_sticks_within_window() {
        let sticky = Sticky::new(balancer(), Duration::from_secs(60));
        let opts = PickOptions {
            session_id: Some("s-1"),
        };
        let first = sticky.pick(&opts).unwrap();
        for _ in 0..5 {
            assert_eq!(sticky.pick(&opts).unwrap(), first);
        }

        // 没有会话时按内部策略轮转
        let a = sticky.pick(&PickOptions::default()).unwrap();
        let b = sticky.pick(&PickOptions::default()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn expired_window_repicks() {
        let sticky = Sticky::new(balancer(), Duration::ZERO);
        let opts = PickOptions {
            session_id: Some("s-1"),
        };
        let first = sticky.pick(&opts).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_ne!(sticky.pick(&opts).unwrap(), first);
    }

    #[tokio::test]
    async fn failed_instance_breaks_stickiness() {
        let guarded: Arc<dyn LoadBalancer> = Arc::new(BlackWhiteList::new(
            balancer(),
            Arc::new(TcpProber::new(Duration::from_millis(10))),
            &BlackWhiteListConfig::default(),
        ));
        let sticky = Sticky::new(guarded, Duration::from_secs(60));
        let opts = PickOptions {
            session_id: Some("s-1"),
        };
        let first = sticky.pick(&opts).unwrap();
        sticky.report_failure(&first);
        let second = sticky.pick(&opts).unwrap();
        assert_ne!(second, first);
        assert_eq!(sticky.pick(&opts).unwrap(), second);
    }
}
