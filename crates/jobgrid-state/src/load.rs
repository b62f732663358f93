//! Load snapshots used to rank dispatch candidates.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::HostUrl;

/// Current versus maximum load of one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeLoad {
    pub host: HostUrl,
    pub current_load: f64,
    pub max_load: f64,
}

impl NodeLoad {
    pub fn new(host: &str, current_load: f64, max_load: f64) -> Self {
        Self {
            host: host.to_string(),
            current_load,
            max_load,
        }
    }

    /// `current_load / max_load`.
    ///
    /// A host without capacity (`max_load <= 0`) reports infinity so it
    /// always ranks last.
    pub fn load_factor(&self) -> f64 {
        if self.max_load <= 0.0 {
            f64::INFINITY
        } else {
            self.current_load / self.max_load
        }
    }

    /// Ranking order: ascending load factor, ties broken by host.
    pub fn rank(&self, other: &NodeLoad) -> Ordering {
        self.load_factor()
            .total_cmp(&other.load_factor())
            .then_with(|| self.host.cmp(&other.host))
    }

    /// Whether another `job_load` fits under `max_load`.
    ///
    /// An idle host always has room, so a job larger than any host's
    /// capacity can still run somewhere.
    pub fn has_capacity_for(&self, job_load: f64) -> bool {
        self.current_load <= 0.0 || self.current_load + job_load <= self.max_load
    }

    /// Whether this host is strictly more loaded than `other`.
    pub fn exceeds(&self, other: &NodeLoad) -> bool {
        self.load_factor() > other.load_factor()
    }
}

/// Load of every host in the cluster at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemLoad {
    nodes: BTreeMap<HostUrl, NodeLoad>,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the load entry for a host.
    pub fn add_node_load(&mut self, load: NodeLoad) {
        self.nodes.insert(load.host.clone(), load);
    }

    pub fn get(&self, host: &str) -> Option<&NodeLoad> {
        self.nodes.get(host)
    }

    /// Add `delta` to a host's current load. Returns false for unknown hosts.
    pub fn update_node_load(&mut self, host: &str, delta: f64) -> bool {
        match self.nodes.get_mut(host) {
            Some(node) => {
                node.current_load += delta;
                true
            }
            None => false,
        }
    }

    /// Load factor of a host, or `None` if it is not part of this snapshot.
    pub fn load_factor(&self, host: &str) -> Option<f64> {
        self.nodes.get(host).map(NodeLoad::load_factor)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
