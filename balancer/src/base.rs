use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use common::service_register_center::typos::{RunMode, Service, ServiceKey, ServiceList};
use common::{Error, Result};

use crate::picker::{Picker, PickerBuilder, PickerBuilders};
use crate::{LoadBalancer, PickOptions};

/// 一次完整的快照：实例列表和据此构建的选择器一起替换
struct Snapshot {
    list: Arc<ServiceList>,
    picker: Arc<dyn Picker>,
}

/// 基础负载均衡器
///
/// 读路径只做一次原子加载，更新时整体构建新快照后替换，读方看不到半新半旧的状态
pub struct Balancer {
    strategy: String,
    builder: PickerBuilder,
    state: ArcSwap<Snapshot>,
}

impl Balancer {
    pub fn new(strategy: &str, builders: &PickerBuilders) -> Result<Self> {
        let builder = builders.get(strategy)?;
        let list = Arc::new(ServiceList::default().with_run_mode(RunMode::Init));
        let picker = builder(Vec::new());
        Ok(Self {
            strategy: strategy.to_string(),
            builder,
            state: ArcSwap::from_pointee(Snapshot { list, picker }),
        })
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn version(&self) -> u64 {
        self.state.load().list.version
    }

    /// 应用新列表，返回是否生效
    pub fn update(&self, list: Arc<ServiceList>) -> bool {
        let picker = (self.builder)(list.services.clone());
        let next = Arc::new(Snapshot {
            list: list.clone(),
            picker,
        });
        let previous = self.state.rcu(|current| {
            if list.version < current.list.version {
                current.clone()
            } else {
                next.clone()
            }
        });
        let applied = list.version >= previous.list.version;
        if applied {
            debug!(
                "Balancer ({}) updated to version {} with {} instances",
                self.strategy,
                list.version,
                list.services.len()
            );
        } else {
            info!(
                "Dropping stale instance list version {} (current {})",
                list.version, previous.list.version
            );
        }
        applied
    }
}

impl LoadBalancer for Balancer {
    fn pick(&self, _opts: &PickOptions<'_>) -> Result<Service> {
        let state = self.state.load();
        state
            .picker
            .next()
            .ok_or_else(|| Error::NotFound(format!("{} 没有可用实例", state.list.name)))
    }

    fn handle(&self, _key: &ServiceKey, list: Arc<ServiceList>) {
        self.update(list);
    }

    fn snapshot(&self) -> Arc<ServiceList> {
        self.state.load().list.clone()
    }
}
