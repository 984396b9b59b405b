use reqwest::{Certificate, Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use std::path::Path;
use std::time::Duration;

use super::error::{ApiError, ErrorBody};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("error reading trust CA file: {0}")]
    TrustCA(std::io::Error),
    #[error("error building HTTP client: {0}")]
    Client(reqwest::Error),
}

/// How a next-hop call failed. The caller decides which envelope a
/// transport failure maps to; a decoded remote error is relayed as-is.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("{0}")]
    Remote(ApiError),
    #[error("malformed reply from next hop: {0}")]
    Reply(reqwest::Error),
    #[error("cannot derive next hop URL from `{0}`")]
    Url(Url),
}

/// The one HTTP client used for all chained control calls. Optionally
/// trusts an extra CA for hops behind private TLS terminators.
pub struct NextHopClient {
    client: Client,
}

impl NextHopClient {
    pub fn new(trust_ca_file: Option<&Path>) -> Result<Self, InitError> {
        let mut builder = Client::builder();

        if let Some(path) = trust_ca_file {
            let pem = std::fs::read(path).map_err(InitError::TrustCA)?;
            let cert = Certificate::from_pem(&pem).map_err(InitError::Client)?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(NextHopClient {
            client: builder.build().map_err(InitError::Client)?,
        })
    }

    /// Posts `request` to `<hop>/wireguard/<operation>` and decodes the
    /// reply. Non-OK statuses are decoded as the error envelope and come
    /// back with the `"Error from <host>: "` prefix already applied.
    pub async fn call<Req, Reply>(
        &self,
        hop: &Url,
        operation: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Reply, CallError>
    where
        Req: Serialize,
        Reply: DeserializeOwned,
    {
        let url = join_path(hop, operation).ok_or_else(|| CallError::Url(hop.clone()))?;

        let mut builder = self.client.post(url.clone()).json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(CallError::Transport)?;
        let status = response.status();

        if status != StatusCode::OK {
            let body: ErrorBody = response.json().await.map_err(CallError::Reply)?;
            tracing::warn!(host = %host_label(hop), result = %body.result, error = %body.error, "error from next hop");
            return Err(CallError::Remote(ApiError::from_next_hop(status, body, &host_label(hop))));
        }

        response.json().await.map_err(CallError::Reply)
    }
}

/// Appends `wireguard/<operation>` to the hop URL, keeping any base path
/// the hop was configured with.
fn join_path(hop: &Url, operation: &str) -> Option<Url> {
    let mut url = hop.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty().extend(["wireguard", operation]);
    }
    Some(url)
}

fn host_label(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_keeps_base_paths() {
        let hop = Url::parse("http://hop-b:8080/gw/").unwrap();
        let url = join_path(&hop, "connect").unwrap();
        assert_eq!(url.as_str(), "http://hop-b:8080/gw/wireguard/connect");

        let plain = Url::parse("http://hop-b/").unwrap();
        let url = join_path(&plain, "update").unwrap();
        assert_eq!(url.as_str(), "http://hop-b/wireguard/update");
    }

    #[test]
    fn host_label_includes_explicit_port() {
        let hop = Url::parse("http://hop-b:8080/").unwrap();
        assert_eq!(host_label(&hop), "hop-b:8080");
        let hop = Url::parse("https://hop-b/").unwrap();
        assert_eq!(host_label(&hop), "hop-b");
    }
}
