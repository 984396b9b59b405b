use cidr::IpInet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, InvalidInterfaceName, InvalidKey, Key, PeerConfigBuilder};

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::config::{DatapathConfig, WireguardServerConfig};
use crate::datapath::{self, DatapathHandle, FilterHandle, Rules};
use crate::ip_pool::{self, IpPool};
use crate::netdev;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Subnet(#[from] ip_pool::Error),
    #[error("invalid interface address: {0}")]
    InterfaceAddress(cidr::errors::NetworkParseError),
    #[error("invalid interface name: {0}")]
    InterfaceName(#[from] InvalidInterfaceName),
    #[error("invalid key: {0}")]
    Key(#[from] InvalidKey),
    #[error("invalid peer address `{0}`")]
    PeerAddress(String),
    #[error("key file error: {0}")]
    KeyFile(io::Error),
    #[error("device configuration error: {0}")]
    Device(io::Error),
    #[error("netlink error: {0}")]
    Netdev(#[from] netdev::Error),
    #[error("datapath error: {0}")]
    Datapath(#[from] datapath::Error),
    #[error("no outbound route found")]
    NoOutboundRoute,
    #[error("no usable address on the outbound interface")]
    NoOutboundAddress,
    #[error("tunnel interface `{0}` not found after creation")]
    MissingLink(String),
    #[error("no more internal IPv4 addresses")]
    PoolExhausted4,
    #[error("no more internal IPv6 addresses")]
    PoolExhausted6,
    #[error("peer already exists")]
    PeerExists,
    #[error("peer not found")]
    PeerNotFound,
}

/// Downstream peer parameters as they travel in session state. Addresses
/// stay in text form and are parsed on use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub client_public_key: String,
    pub server_public_key: String,
    pub keep_alive: u16,
    pub internal_ip4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip6: Option<String>,
}

/// One installed downstream peer. Holds what teardown and accounting need;
/// the datapath handle is shared with the owning service.
#[derive(Clone)]
pub struct PeerHandle {
    client_public_key: String,
    ip4: IpAddr,
    ip6: Option<IpAddr>,
    datapath: Arc<DatapathHandle>,
}

#[derive(Clone)]
struct PeerSpec {
    public_key: Key,
    ip4: IpAddr,
    ip6: Option<IpAddr>,
    keep_alive: u16,
}

/// The one server-side tunnel interface of this node. Lives for the whole
/// process; downstream peers come and go on it.
pub struct WgServer {
    interface: InterfaceName,
    listen_port: u16,
    public_key: Key,
    link_index: u32,
    datapath: Arc<DatapathHandle>,
    _wg_filter: FilterHandle,
    ip4: IpAddr,
    ip6: Option<IpAddr>,
    pool4: IpPool,
    pool6: Option<IpPool>,
    peers: Mutex<HashMap<String, PeerSpec>>,
}

impl WgServer {
    /// Brings the server-side tunnel up from scratch: kernel feature check,
    /// outbound-interface discovery, key handling, interface and datapath
    /// setup. Any failure here is fatal for the process.
    pub async fn init(
        config: &WireguardServerConfig,
        datapath_config: &DatapathConfig,
        netlink: &rtnetlink::Handle,
    ) -> Result<Self, Error> {
        tracing::info!("server: initialization");

        datapath::raise_memlock_limit()?;
        datapath::probe(&datapath_config.bridge_object)?;

        let route4 = netdev::route_to(netlink, netdev::PROBE_ADDR_V4.into())
            .await?
            .ok_or(Error::NoOutboundRoute)?;
        let ip4 = match route4.pref_src {
            Some(ip) => ip,
            None => netdev::first_address(netlink, route4.ifindex, false)
                .await?
                .ok_or(Error::NoOutboundAddress)?,
        };
        let ip6 = match netdev::route_to(netlink, netdev::PROBE_ADDR_V6.into()).await? {
            Some(route6) => match route6.pref_src {
                Some(ip) => Some(ip),
                None => netdev::first_address(netlink, route6.ifindex, true).await?,
            },
            None => None,
        };
        tracing::info!(%ip4, ip6 = ?ip6, "server: outbound addresses");

        let pool4 = IpPool::new("wg4", &config.subnet4)?;
        let pool6 = match &config.subnet6 {
            Some(subnet6) => Some(IpPool::new("wg6", subnet6)?),
            None => None,
        };

        let private_key = load_or_generate_key(&config.private_key_file)?;
        let public_key = private_key.get_public();
        tracing::info!(public_key = %public_key.to_base64(), "server: private key loaded");

        let name = format!("{}0", config.nic_prefix);
        let interface = InterfaceName::from_str(&name)?;

        if let Some(stale) = netdev::link_index(netlink, &name).await? {
            tracing::info!(link = %name, "server: removing stale tunnel interface");
            netdev::delete_link(netlink, stale).await?;
        }

        tracing::info!(link = %name, "server: creating tunnel interface");
        netdev::add_wireguard_link(netlink, &name, None).await?;
        let link_index = netdev::link_index(netlink, &name)
            .await?
            .ok_or_else(|| Error::MissingLink(name.clone()))?;

        for subnet in [Some(&config.subnet4), config.subnet6.as_ref()].into_iter().flatten() {
            let inet = IpInet::from_str(subnet).map_err(Error::InterfaceAddress)?;
            tracing::info!(link = %name, %subnet, "server: assigning subnet");
            netdev::add_address(netlink, link_index, inet.address(), inet.network_length()).await?;
        }

        DeviceUpdate::new()
            .set_private_key(private_key)
            .set_listen_port(config.listen_port)
            .apply(&interface, Backend::Kernel)
            .map_err(Error::Device)?;

        tracing::info!(link = %name, "server: installing datapath");
        let datapath = Arc::new(datapath::install(&datapath_config.bridge_object, link_index)?);

        tracing::info!(ifindex = route4.ifindex, "server: installing wg filter on outbound interface");
        let wg_filter = datapath::install_wg_filter(&datapath_config.wg_filter_object, route4.ifindex)?;

        netdev::set_link_up(netlink, link_index).await?;

        Ok(WgServer {
            interface,
            listen_port: config.listen_port,
            public_key,
            link_index,
            datapath,
            _wg_filter: wg_filter,
            ip4,
            ip6,
            pool4,
            pool6,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// One v4 and, when a v6 subnet is configured, one v6 address for a new
    /// downstream peer. Nothing is leaked when only the v6 side runs dry.
    pub fn allocate_internal_ips(&self) -> Result<(IpAddr, Option<IpAddr>), Error> {
        let ip4 = self.pool4.acquire().ok_or(Error::PoolExhausted4)?;

        let ip6 = match &self.pool6 {
            Some(pool6) => match pool6.acquire() {
                Some(ip6) => Some(ip6),
                None => {
                    self.pool4.release(ip4);
                    return Err(Error::PoolExhausted6);
                }
            },
            None => None,
        };

        Ok((ip4, ip6))
    }

    /// Marks addresses busy during session reload.
    pub fn reserve_internal_ips(&self, ip4: Option<IpAddr>, ip6: Option<IpAddr>) {
        if let Some(ip4) = ip4 {
            self.pool4.set_acquired(ip4);
        }
        if let (Some(pool6), Some(ip6)) = (&self.pool6, ip6) {
            pool6.set_acquired(ip6);
        }
    }

    pub fn add(&self, profile: &Profile) -> Result<PeerHandle, Error> {
        tracing::info!(public_key = %profile.client_public_key, "server: add peer");

        let ip4: IpAddr = profile
            .internal_ip4
            .parse()
            .map_err(|_| Error::PeerAddress(profile.internal_ip4.clone()))?;
        let ip6 = match &profile.internal_ip6 {
            Some(raw) => Some(raw.parse().map_err(|_| Error::PeerAddress(raw.clone()))?),
            None => None,
        };

        let release_ips = || {
            self.pool4.release(ip4);
            if let (Some(pool6), Some(ip6)) = (&self.pool6, ip6) {
                pool6.release(ip6);
            }
        };

        let public_key = match Key::from_base64(&profile.client_public_key) {
            Ok(key) => key,
            Err(e) => {
                release_ips();
                return Err(e.into());
            }
        };

        let mut peers = self.peers.lock().expect("peers lock poisoned");
        if peers.contains_key(&profile.client_public_key) {
            release_ips();
            return Err(Error::PeerExists);
        }

        peers.insert(
            profile.client_public_key.clone(),
            PeerSpec {
                public_key,
                ip4,
                ip6,
                keep_alive: profile.keep_alive,
            },
        );

        if let Err(e) = self.configure_peers(&peers) {
            peers.remove(&profile.client_public_key);
            release_ips();
            return Err(e);
        }

        Ok(PeerHandle {
            client_public_key: profile.client_public_key.clone(),
            ip4,
            ip6,
            datapath: Arc::clone(&self.datapath),
        })
    }

    pub fn remove(&self, handle: &PeerHandle) -> Result<(), Error> {
        tracing::info!(public_key = %handle.client_public_key, "server: remove peer");

        let mut peers = self.peers.lock().expect("peers lock poisoned");
        if peers.remove(&handle.client_public_key).is_none() {
            return Err(Error::PeerNotFound);
        }
        self.configure_peers(&peers)?;
        drop(peers);

        for ip in [Some(handle.ip4), handle.ip6].into_iter().flatten() {
            match ip {
                IpAddr::V4(_) => self.pool4.release(ip),
                IpAddr::V6(_) => {
                    if let Some(pool6) = &self.pool6 {
                        pool6.release(ip);
                    }
                }
            }
            if let Err(e) = self.datapath.delete_src_rule(ip) {
                tracing::error!(%ip, error = %e, "server: delete src rule");
            }
        }

        Ok(())
    }

    /// Replaces the device's peer set with the given state wholesale.
    fn configure_peers(&self, peers: &HashMap<String, PeerSpec>) -> Result<(), Error> {
        let mut update = DeviceUpdate::new().replace_peers();
        for spec in peers.values() {
            let mut peer = PeerConfigBuilder::new(&spec.public_key)
                .set_persistent_keepalive_interval(spec.keep_alive)
                .add_allowed_ip(spec.ip4, 32);
            if let Some(ip6) = spec.ip6 {
                peer = peer.add_allowed_ip(ip6, 128);
            }
            update = update.add_peer(peer);
        }
        update.apply(&self.interface, Backend::Kernel).map_err(Error::Device)
    }

    pub fn public_key(&self) -> String {
        self.public_key.to_base64()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The node's external (public) addresses.
    pub fn ips(&self) -> (IpAddr, Option<IpAddr>) {
        (self.ip4, self.ip6)
    }

    pub fn link_index(&self) -> u32 {
        self.link_index
    }

    pub fn datapath(&self) -> Arc<DatapathHandle> {
        Arc::clone(&self.datapath)
    }
}

impl PeerHandle {
    /// Programs the outbound half of the bridge: traffic arriving from this
    /// peer gets its source rewritten to the upstream-assigned address and
    /// is redirected to the upstream interface. A family is only programmed
    /// when both sides have an address of it.
    pub fn setup_forwarding(
        &self,
        upstream_ip4: Option<IpAddr>,
        upstream_ip6: Option<IpAddr>,
        to_ifindex: u32,
    ) -> Result<(), datapath::Error> {
        if let Some(up4) = upstream_ip4 {
            tracing::debug!(from = %self.ip4, to = %up4, to_ifindex, "server: set src rule");
            self.datapath.set_src_rule(self.ip4, up4, to_ifindex)?;
        }

        if let (Some(ip6), Some(up6)) = (self.ip6, upstream_ip6) {
            tracing::debug!(from = %ip6, to = %up6, to_ifindex, "server: set src rule");
            self.datapath.set_src_rule(ip6, up6, to_ifindex)?;
        }

        Ok(())
    }

    /// Packet/byte counters from this peer's src rules; absent keys count
    /// as zero.
    pub fn stats(&self) -> (u64, u64) {
        let mut packets = 0;
        let mut bytes = 0;

        for ip in [Some(self.ip4), self.ip6].into_iter().flatten() {
            match self.datapath.lookup(Rules::Src, ip) {
                Ok(Some(value)) => {
                    packets += value.packets;
                    bytes += value.bytes;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(%ip, error = %e, "server: failed to look up src rule"),
            }
        }

        (packets, bytes)
    }

    pub fn ip4(&self) -> IpAddr {
        self.ip4
    }

    pub fn ip6(&self) -> Option<IpAddr> {
        self.ip6
    }
}

/// Reads the base64 server key, generating and persisting a fresh one with
/// owner-only permissions when the file does not exist yet.
fn load_or_generate_key(path: &Path) -> Result<Key, Error> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Key::from_base64(content.trim())?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(file = %path.display(), "server: key file not found, generating a new one");
            let key = Key::generate_private();

            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(Error::KeyFile)?;
            file.write_all(key.to_base64().as_bytes()).map_err(Error::KeyFile)?;

            Ok(key)
        }
        Err(e) => Err(Error::KeyFile(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_key_is_persisted_and_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.key");

        let generated = load_or_generate_key(&path).unwrap();
        let reloaded = load_or_generate_key(&path).unwrap();
        assert_eq!(generated.to_base64(), reloaded.to_base64());

        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn garbage_key_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.key");
        std::fs::write(&path, "not a key").unwrap();

        assert!(matches!(load_or_generate_key(&path), Err(Error::Key(_))));
    }
}
