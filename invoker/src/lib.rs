//! 调用编排
//!
//! 把服务解析、负载均衡、熔断和传输串成一次完整的出站调用。

mod backoff;
mod orchestrator;
mod pool;
mod transport;

pub use backoff::RetryBackoff;
pub use orchestrator::{Invoker, TARGET_SERVICE_HEADER};
pub use pool::InvocationPool;
pub use transport::{HttpTransport, Response, Transport};
