use cidr::{IpCidr, IpInet};
use thiserror::Error;

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid subnet: {0}")]
    Subnet(#[from] cidr::errors::NetworkParseError),
}

/// Allocates internal addresses out of one subnet. The network base and the
/// first usable address are reserved; released addresses are handed out
/// again before the cursor advances. Busy and free sets are keyed by the
/// canonical text form of the address.
#[derive(Debug)]
pub struct IpPool {
    name: String,
    subnet: IpCidr,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    cursor: IpAddr,
    busy: HashSet<String>,
    free: BTreeSet<String>,
}

impl IpPool {
    /// Accepts both plain network form (`10.40.0.0/16`) and the
    /// address-with-prefix form used for interface assignment
    /// (`10.40.0.1/16`); allocation always works on the network.
    pub fn new(name: &str, subnet: &str) -> Result<Self, Error> {
        let subnet = IpInet::from_str(subnet)?.network();
        // skip the network base and the node's own address
        let cursor = inc_ip(inc_ip(subnet.first_address()));

        Ok(IpPool {
            name: name.to_string(),
            subnet,
            state: Mutex::new(State {
                cursor,
                busy: HashSet::new(),
                free: BTreeSet::new(),
            }),
        })
    }

    /// The node's own internal address: network base + 1.
    pub fn first(&self) -> IpAddr {
        inc_ip(self.subnet.first_address())
    }

    pub fn subnet(&self) -> &IpCidr {
        &self.subnet
    }

    /// Marks an address busy without going through `acquire`, so reloaded
    /// sessions keep their assignments.
    pub fn set_acquired(&self, ip: IpAddr) {
        let key = ip.to_string();
        let mut state = self.state.lock().expect("ip pool lock poisoned");
        state.free.remove(&key);
        state.busy.insert(key);
    }

    pub fn acquire(&self) -> Option<IpAddr> {
        let mut state = self.state.lock().expect("ip pool lock poisoned");

        if let Some(key) = state.free.pop_first() {
            state.busy.insert(key.clone());
            return key.parse().ok();
        }

        // addresses may have been marked busy by set_acquired
        while state.busy.contains(&state.cursor.to_string()) {
            state.cursor = inc_ip(state.cursor);
        }

        if !self.subnet.contains(&state.cursor) {
            tracing::warn!(pool = %self.name, "address pool exhausted");
            return None;
        }

        let ip = state.cursor;
        state.cursor = inc_ip(state.cursor);
        state.busy.insert(ip.to_string());
        Some(ip)
    }

    pub fn release(&self, ip: IpAddr) {
        let key = ip.to_string();
        let mut state = self.state.lock().expect("ip pool lock poisoned");
        state.busy.remove(&key);
        state.free.insert(key);
    }
}

fn inc_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            inc_bytes(&mut octets);
            IpAddr::V4(octets.into())
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            inc_bytes(&mut octets);
            IpAddr::V6(octets.into())
        }
    }
}

fn inc_bytes(bytes: &mut [u8]) {
    for byte in bytes.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn first_is_base_plus_one() {
        let pool = IpPool::new("v4", "10.40.0.0/16").unwrap();
        assert_eq!(pool.first(), "10.40.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn acquire_starts_at_base_plus_two() {
        let pool = IpPool::new("v4", "10.40.0.0/16").unwrap();
        assert_eq!(pool.acquire(), Some("10.40.0.2".parse().unwrap()));
        assert_eq!(pool.acquire(), Some("10.40.0.3".parse().unwrap()));
    }

    #[test]
    fn released_address_is_reused() {
        let pool = IpPool::new("v4", "10.40.0.0/16").unwrap();
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();

        pool.release(first);
        assert_eq!(pool.acquire(), Some(first));
    }

    #[test]
    fn exhausted_pool_returns_none() {
        // /30 holds four addresses; base and base+1 are reserved
        let pool = IpPool::new("v4", "192.0.2.0/30").unwrap();
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(pool.acquire().unwrap()));
        assert!(seen.insert(pool.acquire().unwrap()));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn set_acquired_is_skipped_by_the_cursor() {
        let pool = IpPool::new("v4", "10.40.0.0/16").unwrap();
        pool.set_acquired("10.40.0.2".parse().unwrap());
        pool.set_acquired("10.40.0.3".parse().unwrap());
        assert_eq!(pool.acquire(), Some("10.40.0.4".parse().unwrap()));
    }

    #[test]
    fn host_bits_form_masks_to_network() {
        let pool = IpPool::new("v4", "10.40.0.1/16").unwrap();
        assert_eq!(pool.first(), "10.40.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pool.acquire(), Some("10.40.0.2".parse().unwrap()));
    }

    #[test]
    fn works_for_ipv6_subnets() {
        let pool = IpPool::new("v6", "fd00:40::/64").unwrap();
        assert_eq!(pool.first(), "fd00:40::1".parse::<IpAddr>().unwrap());
        assert_eq!(pool.acquire(), Some("fd00:40::2".parse().unwrap()));
    }

    #[rstest]
    #[case("not-a-subnet")]
    #[case("10.40.0.0/33")]
    fn rejects_malformed_subnets(#[case] subnet: &str) {
        assert!(IpPool::new("bad", subnet).is_err());
    }
}
