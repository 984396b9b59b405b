use serde::{Deserialize, Serialize};

/// Wire messages of the chained control protocol. Requests are forwarded
/// hop by hop with credentials intact; replies travel back unchanged except
/// for the fields each node substitutes with its own tunnel parameters.

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    pub username: String,
    pub password: String,
    pub access_token: String,
    pub client_public_key: String,
    pub next_hops: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectReply {
    pub result: String,
    pub session_id: String,
    pub server_public_key: String,
    pub internal_ip: String,
    pub internal_ip_len: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_ip6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_ip6_len: Option<u8>,
    pub connect_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_ip6: Option<String>,
    pub connect_port: u16,
    pub dns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns6: Option<String>,
    pub mtu: u32,
    pub persistent_keepalive_interval: u16,
    pub rx_timeout: u32,
    pub ttl: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    pub username: String,
    pub password: String,
    pub access_token: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateReply {
    pub result: String,
    pub ttl: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchRequest {
    pub session_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchReply {
    pub result: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectRequest {
    pub username: String,
    pub password: String,
    pub access_token: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectReply {
    pub result: String,
}

pub const RESULT_OK: &str = "OK";
