use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::{ApiConfig, Credentials};
use crate::session::store::{self, Store};
use crate::session::{Session, SessionRecord};
use crate::{wg_client, wg_server};

pub mod error;
pub mod http;
pub mod next_hop;
pub mod protocol;

mod connect;
mod disconnect;
mod update;
mod watch;

pub use error::ApiError;
pub use next_hop::NextHopClient;

/// Ties one downstream peer and one upstream tunnel together per session
/// and drives the chained control protocol. One instance per process.
pub struct Bridge {
    config: ApiConfig,
    wg_server: wg_server::WgServer,
    wg_client: wg_client::WgClient,
    store: Store,
    next_hop: NextHopClient,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("session storage error: {0}")]
    Store(#[from] store::Error),
    #[error("failed to restore session: {0}")]
    Setup(ApiError),
}

impl Bridge {
    /// Returns the bridge and the save-signal receiver for the save worker.
    pub fn new(
        config: ApiConfig,
        wg_server: wg_server::WgServer,
        wg_client: wg_client::WgClient,
    ) -> Result<(Self, mpsc::Receiver<()>), next_hop::InitError> {
        let next_hop = NextHopClient::new(config.trust_ca_file.as_deref())?;
        let (store, save_rx) = Store::new();

        Ok((
            Bridge {
                config,
                wg_server,
                wg_client,
                store,
                next_hop,
            },
            save_rx,
        ))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clients(&self) -> &[Credentials] {
        &self.config.clients
    }

    pub fn admins(&self) -> &[Credentials] {
        &self.config.admins
    }

    /// Installs both tunnel halves for a session, programs the splice rules
    /// and publishes it in the store. Used by `connect` and by reload; on
    /// failure every already-installed piece is reverted best-effort.
    pub(crate) async fn setup_session(&self, record: SessionRecord) -> Result<(), ApiError> {
        let session_id = record.id.clone();

        tracing::info!(session_id = %session_id, "installing downstream peer");
        let downstream = self
            .wg_server
            .add(&record.server_profile)
            .map_err(|e| ApiError::internal_server_error().with_error(e))?;

        tracing::info!(session_id = %session_id, "installing upstream tunnel");
        let upstream = match self.wg_client.add(&record.client_profile).await {
            Ok(handle) => handle,
            Err(e) => {
                self.revert_downstream(&downstream);
                return Err(ApiError::internal_server_error().with_error(e));
            }
        };

        let upstream_ip4 = parse_optional_ip(Some(record.next_hop_internal_ip4.as_str()));
        let upstream_ip6 = parse_optional_ip(record.next_hop_internal_ip6.as_deref());

        tracing::info!(session_id = %session_id, "programming bridge rules");
        let rules = downstream
            .setup_forwarding(upstream_ip4, upstream_ip6, upstream.link_index())
            .and_then(|_| {
                upstream.setup_forwarding(Some(downstream.ip4()), downstream.ip6(), self.wg_server.link_index())
            });
        if let Err(e) = rules {
            self.revert_upstream(&upstream).await;
            self.revert_downstream(&downstream);
            return Err(ApiError::internal_server_error().with_error(e));
        }

        self.wg_server.datapath().dump_maps(self.wg_server.link_index());

        self.store.insert(Session {
            record,
            downstream,
            upstream,
        });
        tracing::info!(session_id = %session_id, "session setup complete");
        Ok(())
    }

    /// Removes both halves of a torn-down session, logging but not
    /// propagating individual failures.
    pub(crate) async fn teardown(&self, session: &Session) {
        if let Err(e) = self.wg_server.remove(&session.downstream) {
            tracing::error!(session_id = %session.record.id, error = %e, "failed to remove downstream peer");
        }
        if let Err(e) = self.wg_client.remove(&session.upstream).await {
            tracing::error!(session_id = %session.record.id, error = %e, "failed to remove upstream tunnel");
        }
    }

    fn revert_downstream(&self, handle: &wg_server::PeerHandle) {
        if let Err(cleanup) = self.wg_server.remove(handle) {
            tracing::error!(error = %cleanup, "failed to revert downstream peer");
        }
    }

    async fn revert_upstream(&self, handle: &wg_client::TunnelHandle) {
        if let Err(cleanup) = self.wg_client.remove(handle).await {
            tracing::error!(error = %cleanup, "failed to revert upstream tunnel");
        }
    }

    /// Restores persisted sessions: expired files and files written under a
    /// different server key are skipped, surviving addresses are re-reserved
    /// and each session goes through the regular install path.
    pub async fn load(&self) -> Result<(), LoadError> {
        let records = store::load_records(&self.config.session_dir).await?;
        let server_public_key = self.wg_server.public_key();
        let now = SystemTime::now();

        for record in records {
            if record.expired(now) {
                continue;
            }
            if record.server_profile.server_public_key != server_public_key {
                tracing::info!(session_id = %record.id, "skipping session saved under a different server key");
                continue;
            }
            if record.next_hops.is_empty() {
                tracing::warn!(session_id = %record.id, "skipping session without next hops");
                continue;
            }

            self.wg_server.reserve_internal_ips(
                parse_optional_ip(Some(record.server_profile.internal_ip4.as_str())),
                parse_optional_ip(record.server_profile.internal_ip6.as_deref()),
            );

            tracing::info!(session_id = %record.id, "restoring session");
            self.setup_session(record).await.map_err(LoadError::Setup)?;
        }

        Ok(())
    }

    /// Writes the current non-expired session set to disk.
    pub async fn save(&self) -> Result<(), store::Error> {
        let records = self.store.records();
        store::save_records(&self.config.session_dir, &records).await
    }

    fn upstream_url(&self, session_id: &str) -> Result<Url, ApiError> {
        self.store
            .upstream_url(session_id)
            .ok_or_else(ApiError::session_not_found)
    }
}

/// Reaps sessions whose expire time has passed; runs for the process
/// lifetime.
pub async fn expire_worker(bridge: Arc<Bridge>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        for session in bridge.store.take_expired(SystemTime::now()) {
            tracing::info!(session_id = %session.record.id, "session expired");
            bridge.teardown(&session).await;
        }
    }
}

/// Persists sessions whenever nudged, at latest every 60 seconds.
pub async fn save_worker(bridge: Arc<Bridge>, mut save_rx: mpsc::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        // the sender lives in the store, so recv cannot return None here
        tokio::select! {
            _ = ticker.tick() => {}
            _ = save_rx.recv() => {}
        }

        if let Err(e) = bridge.save().await {
            tracing::error!(error = %e, "failed to save sessions");
        }
    }
}

fn parse_optional_ip(raw: Option<&str>) -> Option<IpAddr> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            tracing::warn!(address = %raw, "ignoring unparsable internal address");
            None
        }
    }
}
