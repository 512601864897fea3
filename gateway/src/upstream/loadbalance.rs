pub mod least_connections;
pub mod round_robin;
pub mod weighted;

use crate::config::InstanceConfig;
use crate::discovery::{ServiceDescriptor, ServiceRegistry};
use crate::error::GatewayError;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use round_robin::RoundRobinCursor;
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Weighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Weighted => "weighted",
        }
    }
}

impl FromStr for Strategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least_connections" | "least_conn" => Ok(Strategy::LeastConnections),
            "weighted" | "weighted_random" => Ok(Strategy::Weighted),
            other => Err(GatewayError::Config(format!(
                "unknown load balancing strategy: {}",
                other
            ))),
        }
    }
}

/// Cheap to clone: the connection counter is shared via `Arc`.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: String,
    /// The service descriptor with `base_url` pointing at this instance.
    pub descriptor: Arc<ServiceDescriptor>,
    pub weight: u32,
    pub active_connections: Arc<AtomicUsize>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, descriptor: Arc<ServiceDescriptor>, weight: u32) -> Self {
        Self {
            id: id.into(),
            descriptor,
            weight,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn url(&self) -> &str {
        &self.descriptor.base_url
    }

    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero: an unmatched release is a no-op.
    pub fn release(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// RAII guard: releases the connection slot on drop, including when the
/// owning future is cancelled mid-call.
pub struct ConnectionGuard {
    instance: ServiceInstance,
}

impl ConnectionGuard {
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.release();
    }
}

struct ServicePool {
    instances: ArcSwap<Vec<ServiceInstance>>,
    cursor: RoundRobinCursor,
}

impl ServicePool {
    fn new(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: ArcSwap::from_pointee(instances),
            cursor: RoundRobinCursor::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub id: String,
    pub url: String,
    pub weight: u32,
    pub active_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub strategy: Strategy,
    pub instances: Vec<InstanceStats>,
}

/// Ordered instance lists per service plus the selection strategies.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    pools: DashMap<String, Arc<ServicePool>>,
    default_strategy: Strategy,
    overrides: DashMap<String, Strategy>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, default_strategy: Strategy) -> Self {
        Self {
            registry,
            pools: DashMap::new(),
            default_strategy,
            overrides: DashMap::new(),
        }
    }

    /// Replace the instance list of a registered service. With no configured
    /// instances the descriptor's own URL becomes the single instance
    /// `{name}-0`. Counters of instances whose id survives are carried over.
    pub fn set_instances(&self, descriptor: &Arc<ServiceDescriptor>, configured: &[InstanceConfig]) {
        let name = descriptor.name.as_str();
        let mut instances: Vec<ServiceInstance> = if configured.is_empty() {
            vec![ServiceInstance::new(format!("{}-0", name), descriptor.clone(), 1)]
        } else {
            configured
                .iter()
                .enumerate()
                .map(|(i, cfg)| build_instance(descriptor, cfg, i))
                .collect()
        };

        let existing = self.pools.get(name).map(|p| p.value().clone());
        match existing {
            Some(pool) => {
                let old = pool.instances.load();
                for inst in instances.iter_mut() {
                    if let Some(prev) = old.iter().find(|p| p.id == inst.id) {
                        inst.active_connections = prev.active_connections.clone();
                    }
                }
                pool.instances.store(Arc::new(instances));
            }
            None => {
                self.pools
                    .insert(name.to_string(), Arc::new(ServicePool::new(instances)));
            }
        }
        info!(
            "loadbalance: instances updated, service={}, count={}",
            name,
            self.instances(name).len()
        );
    }

    /// Append one instance. Fails for services the registry does not know.
    pub fn add_instance(
        &self,
        name: &str,
        cfg: &InstanceConfig,
    ) -> Result<ServiceInstance, GatewayError> {
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| GatewayError::UnknownService {
                service: name.to_string(),
            })?;
        let pool = self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServicePool::new(Vec::new())))
            .clone();

        let current = pool.instances.load();
        let instance = build_instance(&descriptor, cfg, current.len());
        if current.iter().any(|i| i.id == instance.id) {
            return Err(GatewayError::BadRequest(format!(
                "duplicate instance id: {}",
                instance.id
            )));
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(instance.clone());
        pool.instances.store(Arc::new(next));

        info!(
            "loadbalance: instance added, service={}, id={}, url={}",
            name,
            instance.id,
            instance.url()
        );
        Ok(instance)
    }

    pub fn remove_instance(&self, name: &str, id: &str) -> bool {
        let Some(pool) = self.pools.get(name).map(|p| p.clone()) else {
            return false;
        };
        let current = pool.instances.load();
        if !current.iter().any(|i| i.id == id) {
            return false;
        }
        let next: Vec<ServiceInstance> = current.iter().filter(|i| i.id != id).cloned().collect();
        pool.instances.store(Arc::new(next));
        true
    }

    pub fn remove_service(&self, name: &str) -> bool {
        self.overrides.remove(name);
        self.pools.remove(name).is_some()
    }

    pub fn set_strategy(&self, name: &str, strategy: Strategy) {
        self.overrides.insert(name.to_string(), strategy);
    }

    /// Back to the gateway-wide default strategy.
    pub fn clear_strategy(&self, name: &str) {
        self.overrides.remove(name);
    }

    pub fn strategy_for(&self, name: &str) -> Strategy {
        self.overrides
            .get(name)
            .map(|s| *s.value())
            .unwrap_or(self.default_strategy)
    }

    pub fn instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.pools
            .get(name)
            .map(|p| p.instances.load().as_ref().clone())
            .unwrap_or_default()
    }

    /// Pick an instance of a healthy service and take a connection slot on
    /// it. The caller owes a matching `release_connection`.
    pub fn get_instance(&self, name: &str) -> Option<ServiceInstance> {
        if !self.registry.is_healthy(name) {
            return None;
        }
        let pool = self.pools.get(name)?.clone();
        let instances = pool.instances.load();
        let idx = match self.strategy_for(name) {
            Strategy::RoundRobin => pool.cursor.next(instances.len()),
            Strategy::LeastConnections => least_connections::select(&instances),
            Strategy::Weighted => weighted::select(&instances, &mut rand::thread_rng()),
        }?;
        let instance = instances.get(idx)?.clone();
        instance.inc_active();
        metrics::counter!(
            "gateway_lb_selections_total",
            "service" => name.to_string(),
            "instance" => instance.id.clone(),
        )
        .increment(1);
        Some(instance)
    }

    /// Like `get_instance`, but the slot is released when the guard drops.
    pub fn acquire(&self, name: &str) -> Option<ConnectionGuard> {
        self.get_instance(name)
            .map(|instance| ConnectionGuard { instance })
    }

    /// Saturates at zero; unknown service or instance is a no-op.
    pub fn release_connection(&self, name: &str, instance_id: &str) {
        if let Some(pool) = self.pools.get(name) {
            if let Some(inst) = pool.instances.load().iter().find(|i| i.id == instance_id) {
                inst.release();
            }
        }
    }

    pub fn reset_connections(&self, name: &str) {
        if let Some(pool) = self.pools.get(name) {
            for inst in pool.instances.load().iter() {
                inst.active_connections.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Per-service view sorted by service name.
    pub fn stats(&self) -> Vec<ServiceStats> {
        let mut all: Vec<ServiceStats> = self
            .pools
            .iter()
            .map(|e| ServiceStats {
                service: e.key().clone(),
                strategy: self.strategy_for(e.key()),
                instances: e
                    .value()
                    .instances
                    .load()
                    .iter()
                    .map(|i| InstanceStats {
                        id: i.id.clone(),
                        url: i.url().to_string(),
                        weight: i.weight,
                        active_connections: i.active(),
                    })
                    .collect(),
            })
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }
}

fn build_instance(descriptor: &Arc<ServiceDescriptor>, cfg: &InstanceConfig, idx: usize) -> ServiceInstance {
    let id = cfg
        .id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", descriptor.name, idx));
    let descriptor = match &cfg.url {
        Some(url) if *url != descriptor.base_url => Arc::new(ServiceDescriptor {
            base_url: url.clone(),
            ..descriptor.as_ref().clone()
        }),
        _ => descriptor.clone(),
    };
    ServiceInstance::new(id, descriptor, cfg.weight)
}
