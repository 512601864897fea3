pub mod health;
pub mod registry;

pub use health::HealthChecker;
pub use registry::{HealthStatus, ServiceDescriptor, ServiceHealthRecord, ServiceRegistry};
