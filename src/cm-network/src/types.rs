//! Types shared by the subnet pool, DNS controller, and network manager
//! (spec.md §3 "NetworkState", "Instance", "Firewall rule").

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Composite primary key of a workload instance (spec.md §3 "InstanceIdent").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub item_id: String,
    pub subject_id: String,
    pub instance: u64,
    pub kind: String,
    pub preinstalled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: String,
    pub proto: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub src_ip: String,
    pub dst_ip: String,
    pub proto: String,
    pub dst_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub network_id: String,
    pub subnet: String,
    pub vlan_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub node_id: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub network_id: String,
    pub node_id: String,
    pub ident: InstanceIdent,
    pub ip: String,
    pub exposed_ports: HashSet<ExposedPort>,
    pub dns_servers: Vec<String>,
}

/// All instances currently hosted by one node within one provider network.
#[derive(Debug, Clone, Default)]
pub struct HostInstances {
    pub host: Host,
    pub instances: HashMap<InstanceIdent, Instance>,
}

/// In-memory + persisted record of one overlay network (spec.md §3).
#[derive(Debug, Clone)]
pub struct NetworkState {
    pub network: Network,
    pub hosts: HashMap<String, HostInstances>,
}

/// Caller-declared data accompanying an instance network preparation request
/// (`hosts`/`exposedPorts`/`allowedConnections` before the CM has assigned
/// anything) — mirrors `NetworkServiceData` in `networkmanager.hpp`.
#[derive(Debug, Clone, Default)]
pub struct NetworkServiceData {
    pub hosts: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub allowed_connections: Vec<String>,
}

/// Result of [`crate::manager::NetworkManager::prepare_instance_network_parameters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetworkParameters {
    pub network_id: String,
    pub subnet: String,
    pub vlan_id: u32,
    pub ip: String,
    pub dns_servers: Vec<String>,
    pub firewall_rules: Vec<FirewallRule>,
}

/// Per-node network assignment pushed to the SM controller from
/// [`crate::manager::NetworkManager::update_provider_network`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNetworkParameters {
    pub network_id: String,
    pub subnet: String,
    pub vlan_id: u32,
    pub ip: String,
}
