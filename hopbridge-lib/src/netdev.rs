use futures::TryStreamExt;
use rtnetlink::packet_route::address::{AddressAttribute, AddressScope};
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::{Handle, LinkUnspec, LinkWireguard, RouteMessageBuilder};
use thiserror::Error;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Probe destinations for outbound-interface discovery.
pub const PROBE_ADDR_V4: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
pub const PROBE_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111);

#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("netlink request error: {0}")]
    Netlink(#[from] rtnetlink::Error),
}

/// Network link (interface) information.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
}

/// Result of a route lookup toward a probe address.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub ifindex: u32,
    pub pref_src: Option<IpAddr>,
}

/// Opens an rtnetlink socket and drives its connection on the runtime.
pub fn connect() -> Result<Handle, Error> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);
    Ok(handle)
}

pub async fn list_links(handle: &Handle) -> Result<Vec<LinkInfo>, Error> {
    let links: Vec<_> = handle.link().get().execute().try_collect().await?;

    Ok(links
        .iter()
        .filter_map(|link| {
            let name = link.attributes.iter().find_map(|a| match a {
                LinkAttribute::IfName(n) => Some(n.clone()),
                _ => None,
            })?;
            Some(LinkInfo {
                index: link.header.index,
                name,
            })
        })
        .collect())
}

pub async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>, Error> {
    Ok(list_links(handle)
        .await?
        .into_iter()
        .find(|link| link.name == name)
        .map(|link| link.index))
}

pub async fn add_wireguard_link(handle: &Handle, name: &str, mtu: Option<u32>) -> Result<(), Error> {
    let mut builder = LinkWireguard::new(name);
    if let Some(mtu) = mtu {
        builder = builder.mtu(mtu);
    }
    handle.link().add(builder.build()).execute().await?;
    Ok(())
}

pub async fn delete_link(handle: &Handle, index: u32) -> Result<(), Error> {
    handle.link().del(index).execute().await?;
    Ok(())
}

pub async fn set_link_up(handle: &Handle, index: u32) -> Result<(), Error> {
    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await?;
    Ok(())
}

pub async fn add_address(handle: &Handle, index: u32, address: IpAddr, prefix_len: u8) -> Result<(), Error> {
    handle.address().add(index, address, prefix_len).execute().await?;
    Ok(())
}

/// Route lookup: among routes whose destination covers `dest`, picks the
/// most specific one. The default route matches everything, so on a plain
/// host this resolves to the outbound interface.
pub async fn route_to(handle: &Handle, dest: IpAddr) -> Result<Option<RouteInfo>, Error> {
    let message = match dest {
        IpAddr::V4(_) => RouteMessageBuilder::<Ipv4Addr>::default().build(),
        IpAddr::V6(_) => RouteMessageBuilder::<Ipv6Addr>::default().build(),
    };
    let routes: Vec<_> = handle.route().get(message).execute().try_collect().await?;

    let mut best: Option<(u8, RouteInfo)> = None;
    for msg in &routes {
        let ifindex = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        });
        let Some(ifindex) = ifindex else {
            continue;
        };

        let destination = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(addr) => route_address_to_ip(addr),
            _ => None,
        });
        let prefix_len = msg.header.destination_prefix_length;

        if !route_covers(destination, prefix_len, dest) {
            continue;
        }
        if best.as_ref().is_some_and(|(best_len, _)| *best_len >= prefix_len) {
            continue;
        }

        let pref_src = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::PrefSource(addr) => route_address_to_ip(addr),
            _ => None,
        });

        best = Some((prefix_len, RouteInfo { ifindex, pref_src }));
    }

    Ok(best.map(|(_, info)| info))
}

/// First globally-scoped address of the matching family on an interface.
pub async fn first_address(handle: &Handle, ifindex: u32, want_v6: bool) -> Result<Option<IpAddr>, Error> {
    let addrs: Vec<_> = handle.address().get().execute().try_collect().await?;

    Ok(addrs
        .iter()
        .filter(|msg| msg.header.index == ifindex && msg.header.scope == AddressScope::Universe)
        .filter_map(|msg| {
            msg.attributes.iter().find_map(|a| match a {
                AddressAttribute::Address(ip) if ip.is_ipv6() == want_v6 => Some(*ip),
                _ => None,
            })
        })
        .next())
}

fn route_address_to_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
        RouteAddress::Inet6(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

fn route_covers(destination: Option<IpAddr>, prefix_len: u8, dest: IpAddr) -> bool {
    // default route: no destination attribute, zero prefix
    let Some(destination) = destination else {
        return prefix_len == 0;
    };

    match (destination, dest) {
        (IpAddr::V4(network), IpAddr::V4(ip)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len))
            };
            (u32::from(network) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(network), IpAddr::V6(ip)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len))
            };
            (u128::from(network) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_route_covers_any_destination() {
        assert!(route_covers(None, 0, IpAddr::V4(PROBE_ADDR_V4)));
        assert!(route_covers(None, 0, IpAddr::V6(PROBE_ADDR_V6)));
    }

    #[test]
    fn specific_route_covers_only_its_prefix() {
        let network = "198.51.100.0".parse().unwrap();
        assert!(route_covers(
            Some(network),
            24,
            "198.51.100.77".parse().unwrap()
        ));
        assert!(!route_covers(Some(network), 24, "198.51.101.1".parse().unwrap()));
    }

    #[test]
    fn families_never_cover_each_other() {
        let network = "198.51.100.0".parse().unwrap();
        assert!(!route_covers(Some(network), 24, IpAddr::V6(PROBE_ADDR_V6)));
    }
}
