use std::time::{Duration, SystemTime};

use hopbridge_lib::session::SessionRecord;
use hopbridge_lib::{wg_client, wg_server};

/// A fully-populated session record the way a connect would build it.
pub fn test_record(id: &str, ttl: Duration) -> SessionRecord {
    let now = SystemTime::now();

    SessionRecord {
        id: id.to_string(),
        start_time: now,
        update_time: now,
        expire_time: now + ttl,

        username: "alice".to_string(),
        password: "secret".to_string(),
        access_token: String::new(),

        client_public_key: "client-pub".to_string(),
        next_hops: vec!["http://hop-b:8080/".parse().unwrap()],

        next_hop_server_public_key: "hop-b-pub".to_string(),
        next_hop_connect_ip4: "192.0.2.2".to_string(),
        next_hop_connect_ip6: None,
        next_hop_connect_port: 51820,
        next_hop_internal_ip4: "10.0.0.5".to_string(),
        next_hop_internal_ip6: None,

        dns4: "9.9.9.9".to_string(),
        dns6: None,
        mtu: 1280,
        persistent_keepalive_interval: 25,
        rx_timeout: 60,

        client_profile: wg_client::Profile {
            server_ip: "192.0.2.2".to_string(),
            server_port: 51820,
            server_public_key: "hop-b-pub".to_string(),
            client_private_key: "client-priv".to_string(),
            client_public_key: "minted-pub".to_string(),
            internal_ip4: "10.0.0.5".to_string(),
            internal_ip6: None,
            persistent_keepalive_interval: 25,
            mtu: 1280,
        },
        server_profile: wg_server::Profile {
            client_public_key: "client-pub".to_string(),
            server_public_key: "node-a-pub".to_string(),
            keep_alive: 25,
            internal_ip4: "10.40.0.2".to_string(),
            internal_ip6: None,
        },
    }
}
