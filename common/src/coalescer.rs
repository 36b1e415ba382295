//! 请求合并
//!
//! 同一个键上并发发起的相同请求只执行一次，所有调用方共享同一个结果。
//! 进行中的请求表本身就是"是否有请求在途"的唯一依据，
//! 自我保护模块的清理逻辑直接查询这里。

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{Error, Result};

type Pending<T> = Shared<BoxFuture<'static, Result<T>>>;
type InflightMap<K, T> = Arc<Mutex<HashMap<K, Pending<T>>>>;

/// 请求合并器
pub struct Coalescer<K, T> {
    inflight: InflightMap<K, T>,
}

/// 任务结束（包括 panic）时把键从在途表中移除
struct InflightGuard<K: Eq + Hash, T> {
    inflight: InflightMap<K, T>,
    key: Option<K>,
}

impl<K: Eq + Hash, T> Drop for InflightGuard<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.lock().remove(&key);
        }
    }
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 执行或加入一个在途请求
    ///
    /// 实际工作在独立任务中运行，调用方放弃等待不会中断它，
    /// 其余等待者仍然能拿到结果。
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(pending) => pending.clone(),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let guard = InflightGuard {
                        inflight: Arc::clone(&self.inflight),
                        key: Some(key.clone()),
                    };
                    let work = fetch();
                    tokio::spawn(async move {
                        let result = work.await;
                        drop(guard);
                        let _ = tx.send(result);
                    });
                    let pending = async move {
                        rx.await
                            .unwrap_or_else(|_| Err(Error::Internal("合并请求被中断".to_string())))
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// 该键当前是否有请求在途
    pub fn in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Default for Coalescer<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        debug!("创建请求合并器");
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_fetch() {
        let coalescer: Arc<Coalescer<String, u64>> = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("user".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn errors_are_shared_and_not_cached() {
        let coalescer: Coalescer<&'static str, u64> = Coalescer::new();
        let result = coalescer
            .run("user", || async { Err(Error::NotFound("user".to_string())) })
            .await;
        assert_eq!(result, Err(Error::NotFound("user".to_string())));

        // 完成后不再在途，下一次调用会重新执行
        assert!(!coalescer.in_flight(&"user"));
        let result = coalescer.run("user", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn in_flight_tracks_running_work() {
        let coalescer: Arc<Coalescer<&'static str, u64>> = Arc::new(Coalescer::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let runner = coalescer.clone();
        let handle = tokio::spawn(async move {
            runner
                .run("user", || async move {
                    let _ = release_rx.await;
                    Ok(1)
                })
                .await
        });

        // 等待任务登记
        while !coalescer.in_flight(&"user") {
            tokio::task::yield_now().await;
        }
        release_tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), Ok(1));
        assert!(!coalescer.in_flight(&"user"));
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_cancel_work() {
        let coalescer: Arc<Coalescer<&'static str, u64>> = Arc::new(Coalescer::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = finished.clone();
        let first = coalescer.run("user", move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(5)
        });
        // 第一个调用方超时放弃
        let _ = tokio::time::timeout(Duration::from_millis(5), first).await;

        let second = coalescer.run("user", || async { Ok(99) }).await;
        assert_eq!(second, Ok(5));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
