pub mod circuit_breaker;
pub mod client;
pub mod loadbalance;

pub use circuit_breaker::{BreakerCheck, CircuitBreakerRegistry, CircuitError, CircuitPhase};
pub use client::{RequestOptions, ServiceClient, UpstreamResponse};
pub use loadbalance::{ConnectionGuard, LoadBalancer, ServiceInstance, Strategy};
