pub mod config;
pub mod context;
pub mod runtime;
pub mod service;
pub mod telemetry;

pub use config::PlatformConfig;
pub use context::PlatformContext;
pub use runtime::{Platform, PlatformRuntime};
pub use service::{RestartPolicy, ServiceFuture, ServiceRegistration, ServiceTask};
