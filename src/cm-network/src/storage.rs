//! The CRUD contract the network manager demands from its persistence
//! collaborator (spec.md §1 "deliberately out of scope... consumed only via
//! the interfaces each exposes to the core"). Method names and shape mirror
//! `itf/storage.hpp`'s `StorageItf` (`AddNetwork`, `RemoveNetwork`, `AddHost`,
//! `RemoveHost`, `AddInstance`, `RemoveInstance`, `GetNetworks`, `GetHosts`,
//! `GetInstances`).

use async_trait::async_trait;
use cm_ore::error::CmError;

use crate::types::{Host, Instance, InstanceIdent, Network};

#[async_trait]
pub trait NetworkManagerStorage: Send + Sync {
    async fn add_network(&self, network: &Network) -> Result<(), CmError>;
    async fn remove_network(&self, network_id: &str) -> Result<(), CmError>;
    async fn get_networks(&self) -> Result<Vec<Network>, CmError>;

    async fn add_host(&self, network_id: &str, host: &Host) -> Result<(), CmError>;
    async fn remove_host(&self, network_id: &str, node_id: &str) -> Result<(), CmError>;
    async fn get_hosts(&self, network_id: &str) -> Result<Vec<Host>, CmError>;

    async fn add_instance(&self, instance: &Instance) -> Result<(), CmError>;
    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<(), CmError>;
    async fn get_instances(&self, network_id: &str, node_id: &str) -> Result<Vec<Instance>, CmError>;
}

/// In-memory [`NetworkManagerStorage`] used by tests and, per spec.md §1, as
/// the one persistence implementation the core itself owns (a real
/// SQL-backed store is an external collaborator, out of scope here).
#[derive(Default)]
pub struct InMemoryStorage {
    inner: tokio::sync::Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    networks: Vec<Network>,
    hosts: Vec<(String, Host)>,
    instances: Vec<Instance>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NetworkManagerStorage for InMemoryStorage {
    async fn add_network(&self, network: &Network) -> Result<(), CmError> {
        self.inner.lock().await.networks.push(network.clone());
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), CmError> {
        self.inner.lock().await.networks.retain(|n| n.network_id != network_id);
        Ok(())
    }

    async fn get_networks(&self) -> Result<Vec<Network>, CmError> {
        Ok(self.inner.lock().await.networks.clone())
    }

    async fn add_host(&self, network_id: &str, host: &Host) -> Result<(), CmError> {
        self.inner.lock().await.hosts.push((network_id.to_string(), host.clone()));
        Ok(())
    }

    async fn remove_host(&self, network_id: &str, node_id: &str) -> Result<(), CmError> {
        self.inner.lock().await.hosts.retain(|(nid, h)| !(nid == network_id && h.node_id == node_id));
        Ok(())
    }

    async fn get_hosts(&self, network_id: &str) -> Result<Vec<Host>, CmError> {
        Ok(self.inner.lock().await.hosts.iter().filter(|(nid, _)| nid == network_id).map(|(_, h)| h.clone()).collect())
    }

    async fn add_instance(&self, instance: &Instance) -> Result<(), CmError> {
        self.inner.lock().await.instances.push(instance.clone());
        Ok(())
    }

    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<(), CmError> {
        self.inner.lock().await.instances.retain(|i| &i.ident != ident);
        Ok(())
    }

    async fn get_instances(&self, network_id: &str, node_id: &str) -> Result<Vec<Instance>, CmError> {
        Ok(self.inner.lock().await.instances.iter().filter(|i| i.network_id == network_id && i.node_id == node_id).cloned().collect())
    }
}
