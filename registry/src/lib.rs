//! 服务解析
//!
//! `Resolver` 负责双名注册、三级名称回退解析、本地缓存和轮询 watch；
//! `SelfProtection` 在注册中心不可靠时改用降级快照。

use std::sync::Arc;

use async_trait::async_trait;

use common::service_register_center::typos::{Service, ServiceKey, ServiceList};
use common::Result;

mod protection;
mod resolver;
mod source;

pub use protection::{SelfProtection, WatchKey};
pub use resolver::{Resolver, ResolverOptions};
pub use source::{HttpSnapshotSource, SnapshotSource, SourceSnapshot};

/// 实例列表变更的接收方
///
/// 同一个键的推送可能乱序到达，接收方按版本号丢弃旧数据
pub trait Watcher: Send + Sync {
    fn handle(&self, key: &ServiceKey, list: Arc<ServiceList>);
}

/// 服务发现入口，调用方不关心背后是直接解析还是自我保护
#[async_trait]
pub trait Discovery: Send + Sync {
    /// 解析出带版本的实例列表，并把实际命中的注册名写回 `key.name`
    async fn resolve(&self, key: &mut ServiceKey) -> Result<Arc<ServiceList>>;

    async fn lookup(&self, key: &mut ServiceKey) -> Result<Vec<Service>> {
        let list = self.resolve(key).await?;
        Ok(list.services.clone())
    }

    /// 订阅键的后续变更
    async fn watch(&self, key: &ServiceKey, watcher: Arc<dyn Watcher>) -> Result<()>;

    /// 退订 `watch` 时传入的同一个订阅者，返回是否找到
    async fn unwatch(&self, _key: &ServiceKey, _watcher: &Arc<dyn Watcher>) -> bool {
        false
    }
}
