pub mod coalescer;
pub mod config;
pub mod configs;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod service_register_center;
pub mod window;

pub use error::{Error, Result};
