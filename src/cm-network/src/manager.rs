//! Per-provider overlay network lifecycle (spec.md §4.4), ported from
//! `networkmanager.cpp`: VLAN assignment, subnet+IP allocation via
//! [`crate::subnet_pool::SubnetPool`], firewall rule derivation, DNS record
//! maintenance via [`crate::dns::DnsController`], and persistence through
//! the [`NetworkManagerStorage`] collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use cm_ore::error::CmError;
use rand::Rng;

use crate::dns::DnsController;
use crate::storage::NetworkManagerStorage;
use crate::subnet_pool::SubnetPool;
use crate::types::{
    ExposedPort, FirewallRule, Host, HostInstances, Instance, InstanceIdent, InstanceNetworkParameters, Network, NetworkServiceData, NetworkState, UpdateNetworkParameters,
};

const MAX_VLAN_ID: u32 = 4096;
const VLAN_GENERATE_RETRIES: u32 = 4;

struct Inner {
    subnet_pool: SubnetPool,
    network_states: HashMap<String, NetworkState>,
}

/// Owns every [`NetworkState`] across all providers. All bookkeeping runs
/// under a single mutex; persistence calls happen while it is held so the
/// durable state cannot diverge from the in-memory view (spec.md §5).
pub struct NetworkManager {
    inner: tokio::sync::Mutex<Inner>,
    storage: Arc<dyn NetworkManagerStorage>,
    dns: Arc<DnsController>,
}

impl NetworkManager {
    /// Loads persisted networks/hosts/instances and reserves their subnets
    /// out of the pool (spec.md §2 "RemoveExistedNetworks at startup";
    /// `networkmanager.cpp`'s `Init` + `RemoveExistedNetworks`).
    pub async fn load(subnet_pool: SubnetPool, storage: Arc<dyn NetworkManagerStorage>, dns: Arc<DnsController>) -> Result<Self, CmError> {
        let mut network_states = HashMap::new();

        for network in storage.get_networks().await? {
            let mut hosts = HashMap::new();
            for host in storage.get_hosts(&network.network_id).await? {
                let instances = storage
                    .get_instances(&network.network_id, &host.node_id)
                    .await?
                    .into_iter()
                    .map(|instance| (instance.ident.clone(), instance))
                    .collect();
                hosts.insert(host.node_id.clone(), HostInstances { host, instances });
            }
            network_states.insert(network.network_id.clone(), NetworkState { network, hosts });
        }

        let mut manager = NetworkManager { inner: tokio::sync::Mutex::new(Inner { subnet_pool, network_states }), storage, dns };
        manager.reserve_existing_networks().await?;
        Ok(manager)
    }

    async fn reserve_existing_networks(&mut self) -> Result<(), CmError> {
        let inner = self.inner.get_mut();
        for (network_id, state) in inner.network_states.iter() {
            let subnet: ipnet::Ipv4Net = state.network.subnet.parse().map_err(|_| CmError::internal(format!("invalid persisted subnet: {}", state.network.subnet)))?;
            let mut used_ips = Vec::new();
            for host in state.hosts.values() {
                used_ips.extend(host.host.ip.parse::<std::net::Ipv4Addr>());
                for instance in host.instances.values() {
                    used_ips.extend(instance.ip.parse::<std::net::Ipv4Addr>());
                }
            }
            inner.subnet_pool.reserve_allocated_subnet(network_id, subnet, &used_ips)?;
        }
        Ok(())
    }

    /// All instance idents currently known, across every provider and node
    /// (spec.md §2 `GetInstances`, used by the bin crate at startup).
    pub async fn list_instances(&self) -> Vec<InstanceIdent> {
        let inner = self.inner.lock().await;
        inner.network_states.values().flat_map(|state| state.hosts.values()).flat_map(|host| host.instances.keys().cloned()).collect()
    }

    /// Reconciles the set of providers a node participates in: allocates
    /// subnet+IP+VLAN for newly-seen providers, drops hosts for providers no
    /// longer declared, and returns the per-provider parameters to push to
    /// that node (spec.md §4.4, scenario 5 "Provider add+remove").
    pub async fn update_provider_network(&self, providers: &[String], node_id: &str) -> Result<Vec<UpdateNetworkParameters>, CmError> {
        let mut inner = self.inner.lock().await;

        self.remove_provider_networks(&mut inner, providers, node_id).await?;

        let mut result = Vec::with_capacity(providers.len());
        for provider in providers {
            result.push(self.add_provider_network(&mut inner, provider, node_id).await?);
        }
        Ok(result)
    }

    async fn remove_provider_networks(&self, inner: &mut Inner, providers: &[String], node_id: &str) -> Result<(), CmError> {
        let to_remove: Vec<String> = inner.network_states.iter().filter(|(id, _)| !providers.iter().any(|p| p == *id)).map(|(id, _)| id.clone()).collect();

        for network_id in to_remove {
            let is_empty = {
                let state = inner.network_states.get_mut(&network_id).expect("just listed");
                if let Some(host) = state.hosts.remove(node_id) {
                    self.storage.remove_host(&network_id, node_id).await?;
                    for (ident, instance) in host.instances {
                        self.release_instance(inner, &network_id, &instance.ip, &ident).await?;
                    }
                }
                inner.network_states.get(&network_id).map(|s| s.hosts.is_empty()).unwrap_or(true)
            };

            if is_empty {
                inner.network_states.remove(&network_id);
                inner.subnet_pool.release_subnet(&network_id);
                self.storage.remove_network(&network_id).await?;
            }
        }
        Ok(())
    }

    async fn release_instance(&self, inner: &mut Inner, network_id: &str, ip: &str, ident: &InstanceIdent) -> Result<(), CmError> {
        inner.subnet_pool.release_ip(network_id, ip.parse().map_err(|_| CmError::internal(format!("invalid instance IP: {ip}")))?);
        self.dns.remove_hosts_for_ip(ip).await;
        self.storage.remove_instance(ident).await
    }

    async fn add_provider_network(&self, inner: &mut Inner, network_id: &str, node_id: &str) -> Result<UpdateNetworkParameters, CmError> {
        if let Some(state) = inner.network_states.get(network_id) {
            if let Some(host) = state.hosts.get(node_id) {
                return Ok(UpdateNetworkParameters { network_id: network_id.to_string(), subnet: state.network.subnet.clone(), vlan_id: state.network.vlan_id, ip: host.host.ip.clone() });
            }

            let ip = inner.subnet_pool.acquire_ip(network_id)?;
            let host = Host { node_id: node_id.to_string(), ip: ip.to_string() };
            let params = UpdateNetworkParameters { network_id: network_id.to_string(), subnet: state.network.subnet.clone(), vlan_id: state.network.vlan_id, ip: host.ip.clone() };

            self.storage.add_host(network_id, &host).await?;
            inner.network_states.get_mut(network_id).expect("checked above").hosts.insert(node_id.to_string(), HostInstances { host, instances: HashMap::new() });
            return Ok(params);
        }

        self.create_provider_network(inner, network_id, node_id).await
    }

    async fn create_provider_network(&self, inner: &mut Inner, network_id: &str, node_id: &str) -> Result<UpdateNetworkParameters, CmError> {
        let vlan_id = self.generate_vlan_id(inner);
        let subnet = inner.subnet_pool.acquire_subnet(network_id)?;
        let ip = inner.subnet_pool.acquire_ip(network_id)?;

        let network = Network { network_id: network_id.to_string(), subnet: subnet.to_string(), vlan_id };
        let host = Host { node_id: node_id.to_string(), ip: ip.to_string() };
        let params = UpdateNetworkParameters { network_id: network_id.to_string(), subnet: network.subnet.clone(), vlan_id, ip: host.ip.clone() };

        self.storage.add_network(&network).await?;
        self.storage.add_host(network_id, &host).await?;

        let mut hosts = HashMap::new();
        hosts.insert(node_id.to_string(), HostInstances { host, instances: HashMap::new() });
        inner.network_states.insert(network_id.to_string(), NetworkState { network, hosts });

        Ok(params)
    }

    fn generate_vlan_id(&self, inner: &Inner) -> u32 {
        let mut rng = rand::thread_rng();
        for _ in 0..VLAN_GENERATE_RETRIES {
            let candidate = rng.gen_range(1..=MAX_VLAN_ID);
            if !inner.network_states.values().any(|state| state.network.vlan_id == candidate) {
                return candidate;
            }
        }
        // cVlanGenerateRetries exhausted: fall back to a linear scan so the
        // call cannot fail outright (the original throws here; the core's
        // error surface prefers a result over an unrecoverable panic).
        (1..=MAX_VLAN_ID).find(|candidate| !inner.network_states.values().any(|state| state.network.vlan_id == *candidate)).unwrap_or(MAX_VLAN_ID)
    }

    /// Allocates (or, on restart, reuses) network identity for one instance:
    /// subnet/vlan/ip/dns, firewall rules from declared allowed connections,
    /// and registers its canonical hostnames (spec.md §4.4).
    pub async fn prepare_instance_network_parameters(&self, ident: &InstanceIdent, network_id: &str, node_id: &str, declared: &NetworkServiceData) -> Result<InstanceNetworkParameters, CmError> {
        let mut hosts = declared.hosts.clone();
        hosts.extend(Self::instance_ident_hostnames(ident, network_id));

        let mut inner = self.inner.lock().await;
        let state = inner.network_states.get(network_id).ok_or_else(|| CmError::not_found(format!("network not found: {network_id}")))?;
        if !state.hosts.contains_key(node_id) {
            return Err(CmError::not_found(format!("host not found: {node_id}")));
        }

        let subnet = state.network.subnet.clone();
        let vlan_id = state.network.vlan_id;

        if let Some(existing) = state.hosts.get(node_id).and_then(|h| h.instances.get(ident)).cloned() {
            let firewall_rules = self.prepare_firewall_rules(&inner, &subnet, &existing.ip, &declared.allowed_connections)?;
            self.dns.add_hosts(&existing.ip, &hosts).await?;
            return Ok(InstanceNetworkParameters { network_id: network_id.to_string(), subnet, vlan_id, ip: existing.ip, dns_servers: existing.dns_servers, firewall_rules });
        }

        let ip = inner.subnet_pool.acquire_ip(network_id)?;
        let dns_ip = self.dns.ip().to_string();

        let instance = Instance {
            network_id: network_id.to_string(),
            node_id: node_id.to_string(),
            ident: ident.clone(),
            ip: ip.to_string(),
            exposed_ports: Self::parse_exposed_ports(&declared.exposed_ports)?,
            dns_servers: vec![dns_ip.clone()],
        };

        let firewall_rules = self.prepare_firewall_rules(&inner, &subnet, &instance.ip, &declared.allowed_connections)?;
        self.dns.add_hosts(&instance.ip, &hosts).await?;
        self.storage.add_instance(&instance).await?;

        inner.network_states.get_mut(network_id).expect("checked above").hosts.get_mut(node_id).expect("checked above").instances.insert(ident.clone(), instance.clone());

        Ok(InstanceNetworkParameters { network_id: network_id.to_string(), subnet, vlan_id, ip: instance.ip, dns_servers: instance.dns_servers, firewall_rules })
    }

    /// Releases the IP and hosts entries and drops the instance row. Missing
    /// rows are tolerated so a repeated call is a no-op (spec.md §8
    /// idempotence property).
    pub async fn remove_instance_network_parameters(&self, ident: &InstanceIdent, node_id: &str) -> Result<(), CmError> {
        let mut inner = self.inner.lock().await;
        let network_ids: Vec<String> = inner.network_states.keys().cloned().collect();

        for network_id in network_ids {
            let removed = {
                let state = inner.network_states.get_mut(&network_id).expect("just listed");
                let Some(host) = state.hosts.get_mut(node_id) else { continue };
                host.instances.remove(ident)
            };

            if let Some(instance) = removed {
                self.release_instance(&mut inner, &network_id, &instance.ip, ident).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Flushes pending hosts into the DNS controller and reloads the
    /// resolver (spec.md §4.4 `RestartDNSServer`).
    pub async fn restart_dns_server(&self) -> Result<(), CmError> {
        self.dns.reload().await
    }

    fn parse_exposed_ports(exposed_ports: &[String]) -> Result<std::collections::HashSet<ExposedPort>, CmError> {
        exposed_ports
            .iter()
            .map(|raw| {
                let mut parts = raw.splitn(2, '/');
                let port = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| CmError::invalid_argument(format!("unsupported exposedPorts format: {raw}")))?;
                let proto = parts.next().unwrap_or("tcp");
                Ok(ExposedPort { port: port.to_string(), proto: proto.to_string() })
            })
            .collect()
    }

    /// Parses `peerItem/port[/proto]`, `proto` defaulting to `tcp`
    /// (`ParseAllowConnection`).
    fn parse_allow_connection(connection: &str) -> Result<(String, String, String), CmError> {
        let mut parts = connection.splitn(3, '/');
        let item_id = parts.next().filter(|s| !s.is_empty());
        let port = parts.next().filter(|s| !s.is_empty());
        let (item_id, port) = match (item_id, port) {
            (Some(i), Some(p)) => (i, p),
            _ => return Err(CmError::invalid_argument(format!("unsupported allowed connections format: {connection}"))),
        };
        let proto = parts.next().unwrap_or("tcp");
        Ok((item_id.to_string(), port.to_string(), proto.to_string()))
    }

    fn prepare_firewall_rules(&self, inner: &Inner, subnet: &str, ip: &str, allowed_connections: &[String]) -> Result<Vec<FirewallRule>, CmError> {
        if allowed_connections.is_empty() {
            return Ok(Vec::new());
        }

        let subnet: ipnet::Ipv4Net = subnet.parse().map_err(|_| CmError::internal(format!("invalid subnet: {subnet}")))?;

        allowed_connections
            .iter()
            .map(|connection| {
                let (item_id, port, proto) = Self::parse_allow_connection(connection)?;
                self.find_instance_rule(inner, &item_id, &port, &proto, &subnet, ip)
            })
            .collect()
    }

    /// Finds an instance exposing `port`/`proto` whose `itemId` matches and
    /// whose IP lies outside the caller's subnet (same-subnet traffic needs
    /// no rule; `GetInstanceRule`/`NetworkContainsIP`).
    fn find_instance_rule(&self, inner: &Inner, item_id: &str, port: &str, proto: &str, subnet: &ipnet::Ipv4Net, src_ip: &str) -> Result<FirewallRule, CmError> {
        for state in inner.network_states.values() {
            for host in state.hosts.values() {
                for instance in host.instances.values() {
                    if instance.ident.item_id != item_id {
                        continue;
                    }
                    let Ok(candidate_ip) = instance.ip.parse::<std::net::Ipv4Addr>() else { continue };
                    if subnet.contains(&candidate_ip) {
                        continue;
                    }
                    if instance.exposed_ports.contains(&ExposedPort { port: port.to_string(), proto: proto.to_string() }) {
                        return Ok(FirewallRule { src_ip: src_ip.to_string(), dst_ip: instance.ip.clone(), proto: proto.to_string(), dst_port: port.to_string() });
                    }
                }
            }
        }
        Err(CmError::not_found(format!("no instance exposes {item_id}/{port}/{proto}")))
    }

    /// Synthesizes an instance's canonical hostnames: `<i>.<subject>.<item>`,
    /// `<i>.<subject>.<item>.<network>`, and if `i==0` the short forms
    /// `<subject>.<item>`/`<subject>.<item>.<network>` (`PrepareInstanceIdentHosts`).
    fn instance_ident_hostnames(ident: &InstanceIdent, network_id: &str) -> Vec<String> {
        if ident.item_id.is_empty() || ident.subject_id.is_empty() {
            return Vec::new();
        }

        let mut hosts = vec![format!("{}.{}.{}", ident.instance, ident.subject_id, ident.item_id), format!("{}.{}.{}.{}", ident.instance, ident.subject_id, ident.item_id, network_id)];

        if ident.instance == 0 {
            hosts.push(format!("{}.{}", ident.subject_id, ident.item_id));
        }
        hosts.push(format!("{}.{}.{}", ident.subject_id, ident.item_id, network_id));
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::subnet_pool::{NoRoutes, SubnetPool};

    async fn manager() -> NetworkManager {
        let dns = Arc::new(DnsController::new(std::env::temp_dir(), "10.255.255.1"));
        NetworkManager::load(SubnetPool::new(Box::new(NoRoutes)), Arc::new(InMemoryStorage::new()), dns).await.unwrap()
    }

    fn ident(item: &str) -> InstanceIdent {
        InstanceIdent { item_id: item.to_string(), subject_id: "subj".to_string(), instance: 0, kind: "service".to_string(), preinstalled: false }
    }

    #[tokio::test]
    async fn provider_add_and_remove_matches_scenario_5() {
        let nm = manager().await;

        let added = nm.update_provider_network(&["p1".to_string(), "p2".to_string()], "n0").await.unwrap();
        assert_eq!(added.len(), 2);
        assert_ne!(added[0].vlan_id, added[1].vlan_id);
        assert_ne!(added[0].subnet, added[1].subnet);

        let removed = nm.update_provider_network(&["p1".to_string()], "n0").await.unwrap();
        assert_eq!(removed.len(), 1);

        let inner = nm.inner.lock().await;
        assert!(!inner.network_states.contains_key("p2"));
        assert!(inner.network_states.contains_key("p1"));
    }

    #[tokio::test]
    async fn repeated_update_provider_network_allocates_nothing_new() {
        let nm = manager().await;
        let first = nm.update_provider_network(&["p1".to_string()], "n0").await.unwrap();
        let second = nm.update_provider_network(&["p1".to_string()], "n0").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn prepare_instance_network_parameters_allocates_ip_inside_subnet() {
        let nm = manager().await;
        nm.update_provider_network(&["p1".to_string()], "n0").await.unwrap();

        let params = nm.prepare_instance_network_parameters(&ident("item"), "p1", "n0", &NetworkServiceData::default()).await.unwrap();
        let subnet: ipnet::Ipv4Net = params.subnet.parse().unwrap();
        let ip: std::net::Ipv4Addr = params.ip.parse().unwrap();
        assert!(subnet.contains(&ip));
    }

    #[tokio::test]
    async fn remove_instance_network_parameters_is_idempotent() {
        let nm = manager().await;
        nm.update_provider_network(&["p1".to_string()], "n0").await.unwrap();
        let id = ident("item");
        nm.prepare_instance_network_parameters(&id, "p1", "n0", &NetworkServiceData::default()).await.unwrap();

        nm.remove_instance_network_parameters(&id, "n0").await.unwrap();
        nm.remove_instance_network_parameters(&id, "n0").await.unwrap();
    }

    #[tokio::test]
    async fn firewall_rule_requires_matching_exposed_port() {
        let nm = manager().await;
        nm.update_provider_network(&["p1".to_string(), "p2".to_string()], "n0").await.unwrap();

        let peer_data = NetworkServiceData { hosts: vec![], exposed_ports: vec!["8080".to_string()], allowed_connections: vec![] };
        nm.prepare_instance_network_parameters(&ident("peer"), "p2", "n0", &peer_data).await.unwrap();

        let caller_data = NetworkServiceData { hosts: vec![], exposed_ports: vec![], allowed_connections: vec!["peer/8080".to_string()] };
        let params = nm.prepare_instance_network_parameters(&ident("caller"), "p1", "n0", &caller_data).await.unwrap();
        assert_eq!(params.firewall_rules.len(), 1);
        assert_eq!(params.firewall_rules[0].dst_port, "8080");
    }

    #[tokio::test]
    async fn hostname_collision_is_already_exists() {
        let nm = manager().await;
        nm.update_provider_network(&["p1".to_string()], "n0").await.unwrap();
        nm.update_provider_network(&["p1".to_string()], "n1").await.unwrap();
        nm.prepare_instance_network_parameters(&ident("item"), "p1", "n0", &NetworkServiceData::default()).await.unwrap();

        // Same ident, but hosted on a different node: produces the exact
        // same canonical hostnames, which must collide.
        let err = nm.prepare_instance_network_parameters(&ident("item"), "p1", "n1", &NetworkServiceData::default()).await.unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::AlreadyExists);
    }
}
