//! 熔断
//!
//! `CircuitBreakerPanel` 负责把热更新的配置整理成两级缓存，
//! `BreakerSet` 按服务维护熔断状态机并在调用前决定是否放行。

mod breaker;
mod panel;

pub use breaker::{Breaker, BreakerSet, CircuitState, Permit};
pub use panel::{scope_key, service_name, CircuitBreakerPanel};
