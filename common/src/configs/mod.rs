mod circuit_breaker_config;
mod invoker_config;
mod load_balancing_config;
mod log_config;
mod registry_config;

pub use circuit_breaker_config::*;
pub use invoker_config::*;
pub use load_balancing_config::*;
pub use log_config::*;
pub use registry_config::*;
