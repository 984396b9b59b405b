use url::Url;
use wireguard_control::KeyPair;

use std::time::{Duration, SystemTime};

use super::next_hop::CallError;
use super::protocol::{ConnectReply, ConnectRequest, RESULT_OK};
use super::{ApiError, Bridge};
use crate::session::SessionRecord;
use crate::{wg_client, wg_server};

impl Bridge {
    /// Builds one bridge hop: forwards the connect up the chain, binds
    /// local resources for the downstream peer and replies with this node's
    /// tunnel parameters.
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectReply, ApiError> {
        let hops = self.validate_next_hops(&request.next_hops)?;
        let upstream_url = hops[0].clone();

        tracing::info!(
            username = %request.username,
            next_hop = %upstream_url,
            client_public_key = %request.client_public_key,
            "incoming connect"
        );

        let keypair = KeyPair::generate();
        tracing::info!(
            username = %request.username,
            public_key = %keypair.public.to_base64(),
            "generated upstream key pair"
        );

        let forward = ConnectRequest {
            username: request.username.clone(),
            password: request.password.clone(),
            access_token: request.access_token.clone(),
            client_public_key: keypair.public.to_base64(),
            next_hops: request.next_hops[1..].to_vec(),
        };

        let reply: ConnectReply = match self.next_hop.call(&upstream_url, "connect", &forward, None).await {
            Ok(reply) => reply,
            Err(CallError::Transport(e)) => {
                tracing::warn!(next_hop = %upstream_url, error = %e, "failed to reach next hop");
                return Err(ApiError::next_hop_unavailable().with_error(e));
            }
            Err(CallError::Remote(e)) => return Err(e),
            Err(e) => return Err(ApiError::internal_server_error().with_error(e)),
        };

        tracing::info!(
            username = %request.username,
            session_id = %reply.session_id,
            internal_ip = %reply.internal_ip,
            connect_ip = %reply.connect_ip,
            "response from next hop"
        );

        validate_session_id(&reply.session_id)?;

        let (internal_ip4, internal_ip6) = self
            .wg_server
            .allocate_internal_ips()
            .map_err(|e| ApiError::internal_server_error().with_error(e))?;

        let now = SystemTime::now();
        let record = SessionRecord {
            id: reply.session_id.clone(),
            start_time: now,
            update_time: now,
            expire_time: now + Duration::from_secs(reply.ttl),

            username: request.username.clone(),
            password: request.password.clone(),
            access_token: request.access_token.clone(),

            client_public_key: request.client_public_key.clone(),
            next_hops: hops,

            next_hop_server_public_key: reply.server_public_key.clone(),
            next_hop_connect_ip4: reply.connect_ip.clone(),
            next_hop_connect_ip6: reply.connect_ip6.clone(),
            next_hop_connect_port: reply.connect_port,
            next_hop_internal_ip4: reply.internal_ip.clone(),
            next_hop_internal_ip6: reply.internal_ip6.clone(),

            dns4: reply.dns.clone(),
            dns6: reply.dns6.clone(),
            mtu: reply.mtu,
            persistent_keepalive_interval: reply.persistent_keepalive_interval,
            rx_timeout: reply.rx_timeout,

            client_profile: wg_client::Profile {
                server_ip: reply.connect_ip.clone(),
                server_port: reply.connect_port,
                server_public_key: reply.server_public_key.clone(),
                client_private_key: keypair.private.to_base64(),
                client_public_key: keypair.public.to_base64(),
                internal_ip4: reply.internal_ip.clone(),
                internal_ip6: reply.internal_ip6.clone(),
                persistent_keepalive_interval: reply.persistent_keepalive_interval,
                mtu: reply.mtu,
            },
            server_profile: wg_server::Profile {
                client_public_key: request.client_public_key.clone(),
                server_public_key: self.wg_server.public_key(),
                keep_alive: reply.persistent_keepalive_interval,
                internal_ip4: internal_ip4.to_string(),
                internal_ip6: internal_ip6.map(|ip| ip.to_string()),
            },
        };

        self.setup_session(record).await?;

        let (connect_ip4, connect_ip6) = self.wg_server.ips();

        tracing::info!(
            username = %request.username,
            session_id = %reply.session_id,
            internal_ip = %internal_ip4,
            "connected"
        );

        Ok(ConnectReply {
            result: RESULT_OK.to_string(),
            session_id: reply.session_id,
            server_public_key: self.wg_server.public_key(),
            internal_ip: internal_ip4.to_string(),
            internal_ip_len: 32,
            internal_ip6: internal_ip6.map(|ip| ip.to_string()),
            internal_ip6_len: internal_ip6.map(|_| 128),
            connect_ip: connect_ip4.to_string(),
            connect_ip6: connect_ip6.map(|ip| ip.to_string()),
            connect_port: self.wg_server.listen_port(),
            dns: reply.dns,
            dns6: reply.dns6,
            mtu: reply.mtu,
            persistent_keepalive_interval: reply.persistent_keepalive_interval,
            rx_timeout: reply.rx_timeout,
            ttl: reply.ttl,
        })
    }

    /// This node never terminates a chain, so the hop list must name at
    /// least the upstream and stay within the configured bound; every entry
    /// has to be a well-formed URL.
    fn validate_next_hops(&self, next_hops: &[String]) -> Result<Vec<Url>, ApiError> {
        if next_hops.is_empty() {
            tracing::warn!("no next_hops in connect request");
            return Err(ApiError::not_an_exit_node().with_message("It is not an exit node"));
        }
        if next_hops.len() > self.config.max_hops() {
            tracing::warn!(hops = next_hops.len(), "too many hops in connect request");
            return Err(ApiError::too_many_hops().with_message("Too many hops"));
        }

        next_hops
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    tracing::warn!(url = %raw, error = %e, "invalid URL in next_hops");
                    ApiError::bad_request().with_message("Invalid URL in next_hops")
                })
            })
            .collect()
    }
}

/// Session IDs become file names in the session directory, so anything that
/// is not a plain token is refused.
fn validate_session_id(id: &str) -> Result<(), ApiError> {
    let well_formed = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if well_formed {
        Ok(())
    } else {
        tracing::warn!(session_id = %id, "next hop replied with an unusable session id");
        Err(ApiError::internal_server_error().with_message("Invalid session id from next hop"))
    }
}

#[cfg(test)]
mod tests {
    use super::validate_session_id;
    use rstest::rstest;

    #[rstest]
    #[case("s1")]
    #[case("3f9c2f44-8e1c-4a3e-9a57-0f8d6a2b9d11")]
    #[case("node_a.7")]
    fn accepts_plain_ids(#[case] id: &str) {
        assert!(validate_session_id(id).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("../../etc/passwd")]
    #[case("a/b")]
    #[case(".hidden")]
    fn rejects_path_like_ids(#[case] id: &str) {
        assert!(validate_session_id(id).is_err());
    }
}
