//! Pre-enumerated private CIDR pool (spec.md §4.2), ported from the
//! original's `netpool.cpp`/`ipsubnet.cpp`: six base ranges sliced into /16
//! candidates at construction, handed out one per provider and recycled on
//! release. Route-overlap checking is injected via [`RouteSource`] so the
//! pool stays unit-testable without reading `/proc/net/route`.

use std::collections::{HashMap, VecDeque};

use cm_ore::error::CmError;
use ipnet::Ipv4Net;

/// The base ranges `GetNetPools` slices, each into /16s.
const BASE_POOLS: &[&str] = &["172.17.0.0/16", "172.18.0.0/16", "172.19.0.0/16", "172.20.0.0/14", "172.24.0.0/14", "172.28.0.0/14"];

const TARGET_PREFIX: u8 = 16;

/// A source of currently-configured host routes, checked so a newly
/// acquired subnet never collides with live routing. The real
/// implementation reads the kernel routing table; tests inject a fixed set.
pub trait RouteSource: Send + Sync {
    fn overlaps(&self, candidate: &Ipv4Net) -> bool;
}

/// A `RouteSource` that never reports an overlap — used where the host's
/// routing table is not relevant (most unit tests).
pub struct NoRoutes;

impl RouteSource for NoRoutes {
    fn overlaps(&self, _candidate: &Ipv4Net) -> bool {
        false
    }
}

fn base_pools() -> Vec<Ipv4Net> {
    BASE_POOLS
        .iter()
        .flat_map(|cidr| {
            let base: Ipv4Net = cidr.parse().expect("built-in pool CIDR is well-formed");
            base.subnets(TARGET_PREFIX).expect("target prefix is no smaller than the base prefix")
        })
        .collect()
}

/// Usable host IPs of `subnet`, skipping the network address, the gateway
/// (network + 1), and the broadcast address — mirrors `GenerateSubnetIPs`.
pub fn generate_subnet_ips(subnet: &Ipv4Net) -> Result<VecDeque<std::net::Ipv4Addr>, CmError> {
    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    if broadcast.saturating_sub(network) <= 2 {
        return Err(CmError::invalid_argument(format!("invalid subnet CIDR: {subnet}")));
    }
    let mut ips = VecDeque::new();
    let mut ip = network + 2;
    while ip < broadcast {
        ips.push_back(std::net::Ipv4Addr::from(ip));
        ip += 1;
    }
    Ok(ips)
}

struct Allocation {
    subnet: Ipv4Net,
    ips: VecDeque<std::net::Ipv4Addr>,
}

/// Hands out disjoint /16 subnets (and, within each, individual host IPs)
/// keyed by provider id.
pub struct SubnetPool {
    free: Vec<Ipv4Net>,
    allocated: HashMap<String, Allocation>,
    routes: Box<dyn RouteSource>,
}

impl SubnetPool {
    pub fn new(routes: Box<dyn RouteSource>) -> Self {
        SubnetPool { free: base_pools(), allocated: HashMap::new(), routes }
    }

    /// Returns the provider's existing subnet, or acquires the first free
    /// candidate that does not overlap a current host route.
    pub fn acquire_subnet(&mut self, provider_id: &str) -> Result<Ipv4Net, CmError> {
        if let Some(alloc) = self.allocated.get(provider_id) {
            return Ok(alloc.subnet);
        }

        let pos = self.free.iter().position(|candidate| !self.routes.overlaps(candidate)).ok_or_else(|| CmError::unavailable("no available subnet"))?;
        let subnet = self.free.remove(pos);
        let ips = generate_subnet_ips(&subnet)?;
        self.allocated.insert(provider_id.to_string(), Allocation { subnet, ips });
        Ok(subnet)
    }

    /// Pops the next usable host IP for `provider_id`. The provider must
    /// already have a subnet (call [`Self::acquire_subnet`] first).
    pub fn acquire_ip(&mut self, provider_id: &str) -> Result<std::net::Ipv4Addr, CmError> {
        let alloc = self.allocated.get_mut(provider_id).ok_or_else(|| CmError::not_found(format!("no subnet for provider {provider_id}")))?;
        alloc.ips.pop_front().ok_or_else(|| CmError::no_memory(format!("no available IP for provider {provider_id}")))
    }

    /// Returns `ip` to `provider_id`'s free list. A no-op if the provider
    /// has no current allocation (matches `ReleaseIPToSubnet`).
    pub fn release_ip(&mut self, provider_id: &str, ip: std::net::Ipv4Addr) {
        if let Some(alloc) = self.allocated.get_mut(provider_id) {
            alloc.ips.push_back(ip);
        }
    }

    /// Returns the whole subnet to the free pool. A no-op if the provider
    /// has no current allocation.
    pub fn release_subnet(&mut self, provider_id: &str) {
        if let Some(alloc) = self.allocated.remove(provider_id) {
            self.free.push(alloc.subnet);
        }
    }

    /// Reconstitutes state after restart: removes `subnet` from the free
    /// list (or, if it is not one of the built-in candidates, just records
    /// it) and marks `used_ips` as already handed out, mirroring
    /// `RemoveAllocatedSubnet`.
    pub fn reserve_allocated_subnet(&mut self, provider_id: &str, subnet: Ipv4Net, used_ips: &[std::net::Ipv4Addr]) -> Result<(), CmError> {
        self.free.retain(|candidate| *candidate != subnet);
        let mut ips = generate_subnet_ips(&subnet)?;
        ips.retain(|ip| !used_ips.contains(ip));
        self.allocated.insert(provider_id.to_string(), Allocation { subnet, ips });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generates_ips_skipping_network_gateway_and_broadcast() {
        let subnet: Ipv4Net = "10.0.0.0/30".parse().unwrap();
        let ips = generate_subnet_ips(&subnet).unwrap();
        assert_eq!(ips, VecDeque::from([std::net::Ipv4Addr::new(10, 0, 0, 2)]));
    }

    #[test]
    fn subnet_with_no_usable_hosts_is_an_error() {
        let subnet: Ipv4Net = "10.0.0.0/31".parse().unwrap();
        assert!(generate_subnet_ips(&subnet).is_err());
    }

    #[test]
    fn acquire_is_idempotent_per_provider() {
        let mut pool = SubnetPool::new(Box::new(NoRoutes));
        let a = pool.acquire_subnet("p1").unwrap();
        let b = pool.acquire_subnet("p1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn release_returns_subnet_to_free_pool() {
        let mut pool = SubnetPool::new(Box::new(NoRoutes));
        let before = pool.free.len();
        pool.acquire_subnet("p1").unwrap();
        assert_eq!(pool.free.len(), before - 1);
        pool.release_subnet("p1");
        assert_eq!(pool.free.len(), before);
    }

    #[test]
    fn acquire_ip_without_subnet_is_not_found() {
        let mut pool = SubnetPool::new(Box::new(NoRoutes));
        let err = pool.acquire_ip("nope").unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::NotFound);
    }

    proptest! {
        #[test]
        fn allocated_subnets_are_always_pairwise_disjoint(n in 1usize..6) {
            let mut pool = SubnetPool::new(Box::new(NoRoutes));
            let mut subnets = Vec::new();
            for i in 0..n {
                subnets.push(pool.acquire_subnet(&format!("p{i}")).unwrap());
            }
            for i in 0..subnets.len() {
                for j in (i + 1)..subnets.len() {
                    prop_assert!(!subnets[i].contains(&subnets[j].network()) && !subnets[j].contains(&subnets[i].network()));
                }
            }
        }

        #[test]
        fn every_acquired_ip_lies_within_its_subnet(n in 1usize..4) {
            let mut pool = SubnetPool::new(Box::new(NoRoutes));
            let subnet = pool.acquire_subnet("p").unwrap();
            for _ in 0..n {
                let ip = pool.acquire_ip("p").unwrap();
                prop_assert!(subnet.contains(&ip));
            }
        }
    }
}
