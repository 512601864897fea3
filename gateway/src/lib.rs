pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use server::state::Gateway;
