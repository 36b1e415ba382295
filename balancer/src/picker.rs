use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use common::configs::{
    STRATEGY_RANDOM, STRATEGY_ROUND_ROBIN, STRATEGY_WEIGHTED_RANDOM, STRATEGY_WEIGHTED_ROUND_ROBIN,
};
use common::service_register_center::typos::Service;
use common::{Error, Result};

/// 在一份固定的实例列表上做选择
///
/// 列表变化时整体重建，选择器本身不感知更新
pub trait Picker: Send + Sync + Debug {
    fn next(&self) -> Option<Service>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 选择器构建函数
pub type PickerBuilder = fn(Vec<Service>) -> Arc<dyn Picker>;

/// 轮询，起点随机，避免所有副本启动后同时打到第一个实例
#[derive(Debug)]
pub struct RoundRobinPicker {
    services: Vec<Service>,
    cursor: Mutex<usize>,
}

impl RoundRobinPicker {
    pub fn new(services: Vec<Service>) -> Self {
        let start = if services.is_empty() {
            0
        } else {
            rand::rng().random_range(0..services.len())
        };
        Self {
            services,
            cursor: Mutex::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn next(&self) -> Option<Service> {
        if self.services.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let service = self.services[*cursor % self.services.len()].clone();
        *cursor = (*cursor + 1) % self.services.len();
        Some(service)
    }

    fn len(&self) -> usize {
        self.services.len()
    }
}

/// 均匀随机
#[derive(Debug)]
pub struct RandomPicker {
    services: Vec<Service>,
}

impl RandomPicker {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }
}

impl Picker for RandomPicker {
    fn next(&self) -> Option<Service> {
        if self.services.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..self.services.len());
        Some(self.services[idx].clone())
    }

    fn len(&self) -> usize {
        self.services.len()
    }
}

/// 平滑加权轮询
///
/// 每次选择时所有实例的当前权重加上自身权重，选出当前权重最大的实例后减去总权重
#[derive(Debug)]
pub struct WeightedRoundRobinPicker {
    services: Vec<Service>,
    weights: Vec<i64>,
    total: i64,
    current: Mutex<Vec<i64>>,
}

impl WeightedRoundRobinPicker {
    /// 调用方保证权重均为正数
    pub fn new(services: Vec<Service>) -> Self {
        let weights: Vec<i64> = services.iter().map(|s| s.weight as i64).collect();
        let total = weights.iter().sum();
        let current = vec![0; services.len()];
        Self {
            services,
            weights,
            total,
            current: Mutex::new(current),
        }
    }
}

impl Picker for WeightedRoundRobinPicker {
    fn next(&self) -> Option<Service> {
        if self.services.is_empty() {
            return None;
        }
        let mut current = self.current.lock();
        let mut best = 0;
        for (idx, weight) in self.weights.iter().enumerate() {
            current[idx] += weight;
            if current[idx] > current[best] {
                best = idx;
            }
        }
        current[best] -= self.total;
        Some(self.services[best].clone())
    }

    fn len(&self) -> usize {
        self.services.len()
    }
}

/// 加权随机，按权重前缀和二分查找
#[derive(Debug)]
pub struct WeightedRandomPicker {
    services: Vec<Service>,
    prefix: Vec<u64>,
}

impl WeightedRandomPicker {
    /// 调用方保证权重均为正数
    pub fn new(services: Vec<Service>) -> Self {
        let mut sum = 0u64;
        let prefix = services
            .iter()
            .map(|s| {
                sum += s.weight as u64;
                sum
            })
            .collect();
        Self { services, prefix }
    }
}

impl Picker for WeightedRandomPicker {
    fn next(&self) -> Option<Service> {
        let total = *self.prefix.last()?;
        let point = rand::rng().random_range(0..total);
        let idx = self.prefix.partition_point(|&p| p <= point);
        self.services.get(idx).cloned()
    }

    fn len(&self) -> usize {
        self.services.len()
    }
}

/// 丢弃权重不为正的实例
fn positive_weights(services: Vec<Service>) -> Vec<Service> {
    services
        .into_iter()
        .filter(|s| {
            if s.weight > 0 {
                true
            } else {
                warn!("Skipping instance {} with non-positive weight {}", s.id(), s.weight);
                false
            }
        })
        .collect()
}

fn equal_weights(services: &[Service]) -> bool {
    services.windows(2).all(|pair| pair[0].weight == pair[1].weight)
}

fn round_robin(services: Vec<Service>) -> Arc<dyn Picker> {
    Arc::new(RoundRobinPicker::new(services))
}

fn random(services: Vec<Service>) -> Arc<dyn Picker> {
    Arc::new(RandomPicker::new(services))
}

/// 权重全部相同时退化为普通轮询
fn weighted_round_robin(services: Vec<Service>) -> Arc<dyn Picker> {
    let services = positive_weights(services);
    if equal_weights(&services) {
        return Arc::new(RoundRobinPicker::new(services));
    }
    Arc::new(WeightedRoundRobinPicker::new(services))
}

/// 权重全部相同时退化为均匀随机
fn weighted_random(services: Vec<Service>) -> Arc<dyn Picker> {
    let services = positive_weights(services);
    if equal_weights(&services) {
        return Arc::new(RandomPicker::new(services));
    }
    Arc::new(WeightedRandomPicker::new(services))
}

/// 按名称注册的选择器构建函数
pub struct PickerBuilders {
    builders: DashMap<String, PickerBuilder>,
}

impl PickerBuilders {
    pub fn new() -> Self {
        let builders = Self {
            builders: DashMap::new(),
        };
        builders.install(STRATEGY_ROUND_ROBIN, round_robin);
        builders.install(STRATEGY_RANDOM, random);
        builders.install(STRATEGY_WEIGHTED_ROUND_ROBIN, weighted_round_robin);
        builders.install(STRATEGY_WEIGHTED_RANDOM, weighted_random);
        builders
    }

    pub fn install(&self, name: &str, builder: PickerBuilder) {
        debug!("Installing picker builder: {}", name);
        self.builders.insert(name.to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Result<PickerBuilder> {
        self.builders
            .get(name)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::InvalidArgument(format!("未知的负载均衡策略: {}", name)))
    }

    pub fn build(&self, name: &str, services: Vec<Service>) -> Result<Arc<dyn Picker>> {
        Ok(self.get(name)?(services))
    }
}

impl Default for PickerBuilders {
    fn default() -> Self {
        Self::new()
    }
}
