//! The shared instance-state store.
//!
//! A fixed mapping `id -> Instance`, sized once at startup and never
//! resized. Iteration yields instances in id order. The store is shared by
//! the supervisor, the health prober, and the dispatcher; the mutation
//! discipline lives on [`Instance`](crate::instance::Instance).

use std::sync::Arc;

use crate::config::FleetConfig;
use crate::instance::{Endpoint, Instance, InstanceSnapshot, LifecycleState};

/// Fixed pool of instances, ordered by id.
pub struct InstanceStore {
    instances: Vec<Arc<Instance>>,
}

impl InstanceStore {
    /// Build the pool from configuration: instance `i` listens on
    /// `base_port + i`.
    pub fn new(config: &FleetConfig) -> Self {
        let endpoints = (0..config.mlx_servers.instances)
            .map(|i| {
                Endpoint::new(
                    config.mlx_servers.host.clone(),
                    config.mlx_servers.base_port + i as u16,
                )
            })
            .collect();
        Self::from_endpoints(endpoints, config)
    }

    /// Build the pool from explicit endpoints (ports need not be contiguous).
    pub fn from_endpoints(endpoints: Vec<Endpoint>, config: &FleetConfig) -> Self {
        let instances = endpoints
            .into_iter()
            .enumerate()
            .map(|(id, endpoint)| {
                Arc::new(Instance::new(
                    id,
                    endpoint,
                    &config.load_balancer.circuit_breaker,
                    config.performance.target_tps,
                    config.load_balancer.max_batch_size,
                ))
            })
            .collect();
        Self { instances }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Instance>> {
        self.instances.get(id)
    }

    /// Instances in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.instances.iter()
    }

    /// Instances currently eligible for selection: `Running` lifecycle and a
    /// permitting circuit breaker. The breaker check may transition an open
    /// circuit to half-open.
    pub fn eligible(&self) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|inst| {
                inst.lifecycle_state() == LifecycleState::Running && inst.can_attempt()
            })
            .cloned()
            .collect()
    }

    /// Instances in the given lifecycle state, in id order.
    pub fn in_state(&self, state: LifecycleState) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|inst| inst.lifecycle_state() == state)
            .cloned()
            .collect()
    }

    /// Per-instance snapshots in id order.
    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(|inst| inst.snapshot()).collect()
    }
}
