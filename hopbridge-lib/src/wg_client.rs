use serde::{Deserialize, Serialize};
use thiserror::Error;
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, InvalidInterfaceName, InvalidKey, Key, PeerConfigBuilder};

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{DatapathConfig, WireguardClientConfig};
use crate::datapath::{self, DatapathHandle, Rules};
use crate::netdev;
use crate::nic_pool::NicPool;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upstream address `{0}`")]
    ServerAddress(String),
    #[error("invalid upstream port: 0")]
    ServerPort,
    #[error("invalid key: {0}")]
    Key(#[from] InvalidKey),
    #[error("invalid internal address `{0}`")]
    InternalAddress(String),
    #[error("invalid interface name: {0}")]
    InterfaceName(#[from] InvalidInterfaceName),
    #[error("device configuration error: {0}")]
    Device(io::Error),
    #[error("netlink error: {0}")]
    Netdev(#[from] netdev::Error),
    #[error("datapath error: {0}")]
    Datapath(#[from] datapath::Error),
    #[error("tunnel interface `{0}` not found after creation")]
    MissingLink(String),
    #[error("tunnel not found: {0}")]
    TunnelNotFound(u64),
}

/// Upstream tunnel parameters as they travel in session state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub server_ip: String,
    pub server_port: u16,
    pub server_public_key: String,
    pub client_private_key: String,
    pub client_public_key: String,
    pub internal_ip4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip6: Option<String>,
    pub persistent_keepalive_interval: u16,
    pub mtu: u32,
}

/// One live upstream tunnel interface belonging to a session.
#[derive(Clone)]
pub struct TunnelHandle {
    id: u64,
    nic_suffix: u32,
    name: String,
    link_index: u32,
    datapath: Arc<DatapathHandle>,
    ip4: IpAddr,
    ip6: Option<IpAddr>,
}

/// Creates and tears down per-session upstream tunnel interfaces named
/// `<prefix><suffix>`. Add and remove are serialised on the service.
pub struct WgClient {
    nic_prefix: String,
    bridge_object: PathBuf,
    netlink: rtnetlink::Handle,
    state: Mutex<State>,
}

struct State {
    nic_pool: NicPool,
    counter: u64,
    tunnels: HashMap<u64, String>,
}

impl WgClient {
    /// Purges leftover tunnel interfaces from a previous run and prepares
    /// the service for `add` calls.
    pub async fn init(
        config: &WireguardClientConfig,
        datapath_config: &DatapathConfig,
        netlink: rtnetlink::Handle,
    ) -> Result<Self, Error> {
        tracing::info!(prefix = %config.nic_prefix, "client: initialization");

        let service = WgClient {
            nic_prefix: config.nic_prefix.clone(),
            bridge_object: datapath_config.bridge_object.clone(),
            netlink,
            state: Mutex::new(State {
                nic_pool: NicPool::new(),
                counter: 0,
                tunnels: HashMap::new(),
            }),
        };
        service.cleanup().await?;
        Ok(service)
    }

    /// Deletes every interface matching `<prefix><digits>`.
    async fn cleanup(&self) -> Result<(), Error> {
        for link in netdev::list_links(&self.netlink).await? {
            let Some(suffix) = link.name.strip_prefix(&self.nic_prefix) else {
                continue;
            };
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }

            tracing::info!(link = %link.name, "client: deleting stale tunnel interface");
            netdev::delete_link(&self.netlink, link.index).await?;
        }
        Ok(())
    }

    pub async fn add(&self, profile: &Profile) -> Result<TunnelHandle, Error> {
        let server_ip: IpAddr = profile
            .server_ip
            .parse()
            .map_err(|_| Error::ServerAddress(profile.server_ip.clone()))?;
        if profile.server_port == 0 {
            return Err(Error::ServerPort);
        }

        let client_private_key = Key::from_base64(&profile.client_private_key)?;
        let server_public_key = Key::from_base64(&profile.server_public_key)?;

        let ip4: IpAddr = profile
            .internal_ip4
            .parse()
            .map_err(|_| Error::InternalAddress(profile.internal_ip4.clone()))?;
        let ip6: Option<IpAddr> = match &profile.internal_ip6 {
            Some(raw) => Some(raw.parse().map_err(|_| Error::InternalAddress(raw.clone()))?),
            None => None,
        };

        let mut state = self.state.lock().await;

        let nic_suffix = state.nic_pool.acquire();
        let name = format!("{}{}", self.nic_prefix, nic_suffix);

        match self.install_tunnel(&name, profile, server_ip, client_private_key, server_public_key).await {
            Ok((link_index, datapath)) => {
                let id = state.counter;
                state.counter += 1;
                state.tunnels.insert(id, name.clone());

                tracing::info!(link = %name, ifindex = link_index, "client: tunnel interface created");

                Ok(TunnelHandle {
                    id,
                    nic_suffix,
                    name,
                    link_index,
                    datapath: Arc::new(datapath),
                    ip4,
                    ip6,
                })
            }
            Err(e) => {
                // reverse whatever the failed install left behind
                if let Ok(Some(index)) = netdev::link_index(&self.netlink, &name).await {
                    if let Err(cleanup_err) = netdev::delete_link(&self.netlink, index).await {
                        tracing::error!(link = %name, error = %cleanup_err, "client: failed to delete interface after install error");
                    }
                }
                state.nic_pool.release(nic_suffix);
                Err(e)
            }
        }
    }

    async fn install_tunnel(
        &self,
        name: &str,
        profile: &Profile,
        server_ip: IpAddr,
        client_private_key: Key,
        server_public_key: Key,
    ) -> Result<(u32, DatapathHandle), Error> {
        let interface = InterfaceName::from_str(name)?;

        if let Some(stale) = netdev::link_index(&self.netlink, name).await? {
            netdev::delete_link(&self.netlink, stale).await?;
        }

        netdev::add_wireguard_link(&self.netlink, name, (profile.mtu > 0).then_some(profile.mtu)).await?;
        let link_index = netdev::link_index(&self.netlink, name)
            .await?
            .ok_or_else(|| Error::MissingLink(name.to_string()))?;

        let endpoint = SocketAddr::new(server_ip, profile.server_port);
        let mut peer = PeerConfigBuilder::new(&server_public_key)
            .set_endpoint(endpoint)
            .set_persistent_keepalive_interval(profile.persistent_keepalive_interval)
            .add_allowed_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        if profile.internal_ip6.is_some() {
            peer = peer.add_allowed_ip(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
        }

        DeviceUpdate::new()
            .set_private_key(client_private_key)
            .replace_peers()
            .add_peer(peer)
            .apply(&interface, Backend::Kernel)
            .map_err(Error::Device)?;

        let datapath = datapath::install(&self.bridge_object, link_index)?;

        netdev::set_link_up(&self.netlink, link_index).await?;

        Ok((link_index, datapath))
    }

    pub async fn remove(&self, handle: &TunnelHandle) -> Result<(), Error> {
        tracing::info!(link = %handle.name, "client: remove tunnel");

        let mut state = self.state.lock().await;
        if !state.tunnels.contains_key(&handle.id) {
            return Err(Error::TunnelNotFound(handle.id));
        }

        netdev::delete_link(&self.netlink, handle.link_index).await?;

        state.nic_pool.release(handle.nic_suffix);
        state.tunnels.remove(&handle.id);
        Ok(())
    }
}

impl TunnelHandle {
    /// Programs the return half of the bridge: traffic arriving from the
    /// upstream gets its destination rewritten back to the downstream
    /// peer's address and is redirected to the server-side interface.
    pub fn setup_forwarding(
        &self,
        downstream_ip4: Option<IpAddr>,
        downstream_ip6: Option<IpAddr>,
        to_ifindex: u32,
    ) -> Result<(), datapath::Error> {
        if let Some(down4) = downstream_ip4 {
            tracing::debug!(from = %self.ip4, to = %down4, to_ifindex, "client: set dst rule");
            self.datapath.set_dst_rule(self.ip4, down4, to_ifindex)?;
        }

        if let (Some(ip6), Some(down6)) = (self.ip6, downstream_ip6) {
            tracing::debug!(from = %ip6, to = %down6, to_ifindex, "client: set dst rule");
            self.datapath.set_dst_rule(ip6, down6, to_ifindex)?;
        }

        Ok(())
    }

    /// Packet/byte counters from this tunnel's dst rules; absent keys count
    /// as zero.
    pub fn stats(&self) -> (u64, u64) {
        let mut packets = 0;
        let mut bytes = 0;

        for ip in [Some(self.ip4), self.ip6].into_iter().flatten() {
            match self.datapath.lookup(Rules::Dst, ip) {
                Ok(Some(value)) => {
                    packets += value.packets;
                    bytes += value.bytes;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(%ip, error = %e, "client: failed to look up dst rule"),
            }
        }

        (packets, bytes)
    }

    pub fn link_index(&self) -> u32 {
        self.link_index
    }

    pub fn ip4(&self) -> IpAddr {
        self.ip4
    }

    pub fn ip6(&self) -> Option<IpAddr> {
        self.ip6
    }
}
