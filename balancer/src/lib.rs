//! 负载均衡
//!
//! 策略按名称注册为构建器，配置决定使用哪一个；`Balancer` 持有原子替换的实例快照，
//! `BlackWhiteList` 和 `Sticky` 以装饰器的形式叠加在任意负载均衡器之上。

use std::sync::Arc;

use common::service_register_center::typos::{Service, ServiceKey, ServiceList};
use common::Result;
use registry::Watcher;

mod base;
mod blacklist;
mod picker;
mod sticky;

pub use base::Balancer;
pub use blacklist::{BlackWhiteList, Prober, TcpProber};
pub use picker::{
    Picker, PickerBuilder, PickerBuilders, RandomPicker, RoundRobinPicker, WeightedRandomPicker,
    WeightedRoundRobinPicker,
};
pub use sticky::Sticky;

/// 单次选择的参数
#[derive(Debug, Clone, Copy, Default)]
pub struct PickOptions<'a> {
    /// 会话粘滞使用的会话ID
    pub session_id: Option<&'a str>,
}

/// 负载均衡器
pub trait LoadBalancer: Send + Sync {
    /// 选择一个实例，没有可用实例时返回 NotFound
    fn pick(&self, opts: &PickOptions<'_>) -> Result<Service>;

    /// 接收实例列表推送，版本低于当前快照的推送被丢弃
    fn handle(&self, key: &ServiceKey, list: Arc<ServiceList>);

    /// 当前生效的实例列表
    fn snapshot(&self) -> Arc<ServiceList>;

    /// 实例当前是否可选
    fn available(&self, _service: &Service) -> bool {
        true
    }

    /// 调用方报告实例连接失败
    fn report_failure(&self, _service: &Service) {}
}

/// 把负载均衡器接到解析器的 watch 上
pub struct BalancerWatcher(pub Arc<dyn LoadBalancer>);

impl Watcher for BalancerWatcher {
    fn handle(&self, key: &ServiceKey, list: Arc<ServiceList>) {
        self.0.handle(key, list);
    }
}
