use serde::{Deserialize, Serialize};
use url::Url;

use std::time::SystemTime;

use crate::{wg_client, wg_server};

pub mod store;

pub use store::Store;

/// Everything about a session that survives a restart. The runtime handles
/// live next to it in [`Session`] and are rebuilt on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub start_time: SystemTime,
    pub update_time: SystemTime,
    pub expire_time: SystemTime,

    // credentials as received; forwarded verbatim along the chain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,

    pub client_public_key: String,
    /// Remaining hops; the first entry is this node's upstream.
    pub next_hops: Vec<Url>,

    pub next_hop_server_public_key: String,
    pub next_hop_connect_ip4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_connect_ip6: Option<String>,
    pub next_hop_connect_port: u16,
    pub next_hop_internal_ip4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_internal_ip6: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns6: Option<String>,
    pub mtu: u32,
    pub persistent_keepalive_interval: u16,
    pub rx_timeout: u32,

    pub client_profile: wg_client::Profile,
    pub server_profile: wg_server::Profile,
}

/// One live bridge: the persisted record plus the two installed halves.
pub struct Session {
    pub record: SessionRecord,
    pub downstream: wg_server::PeerHandle,
    pub upstream: wg_client::TunnelHandle,
}

impl SessionRecord {
    pub fn expired(&self, now: SystemTime) -> bool {
        self.expire_time <= now
    }

    /// The URL control requests are forwarded to.
    pub fn upstream_url(&self) -> &Url {
        &self.next_hops[0]
    }
}
