use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;

use std::net::SocketAddr;
use std::sync::Arc;

use super::protocol::{
    ConnectReply, ConnectRequest, DisconnectReply, DisconnectRequest, UpdateReply, UpdateRequest, WatchReply,
    WatchRequest,
};
use super::{ApiError, Bridge};
use crate::config::Credentials;
use crate::session::SessionRecord;
use crate::session::store::SessionStats;

pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/wireguard/connect", post(connect))
        .route("/wireguard/update", post(update))
        .route("/wireguard/watch", post(watch))
        .route("/wireguard/disconnect", post(disconnect))
        .route("/admin/sessions", get(admin_sessions))
        .with_state(bridge)
}

/// Binds every configured listener and serves the API on each.
pub async fn serve(bridge: Arc<Bridge>, addrs: &[SocketAddr]) -> std::io::Result<()> {
    let app = router(bridge);

    for addr in addrs {
        let listener = TcpListener::bind(*addr).await?;
        tracing::info!(%addr, "listening");

        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "API server error");
            }
        });
    }

    Ok(())
}

async fn connect(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ConnectReply>, ApiError> {
    authenticate_client(&headers, bridge.clients())?;
    let request: ConnectRequest = parse_json(&body)?;
    bridge.connect(request).await.map(Json)
}

async fn update(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UpdateReply>, ApiError> {
    authenticate_client(&headers, bridge.clients())?;
    let request: UpdateRequest = parse_json(&body)?;
    bridge.update(request).await.map(Json)
}

async fn watch(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WatchReply>, ApiError> {
    authenticate_client(&headers, bridge.clients())?;
    let request: WatchRequest = parse_json(&body)?;
    bridge.watch(request).await.map(Json)
}

async fn disconnect(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DisconnectReply>, ApiError> {
    authenticate_client(&headers, bridge.clients())?;
    let request: DisconnectRequest = parse_json(&body)?;
    bridge.disconnect(request).await.map(Json)
}

#[derive(Serialize)]
struct AdminSession {
    #[serde(flatten)]
    record: SessionRecord,
    #[serde(flatten)]
    stats: SessionStats,
}

async fn admin_sessions(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AdminSession>>, ApiError> {
    authenticate_admin(&headers, bridge.admins())?;

    let sessions = bridge
        .store()
        .records_with_stats()
        .into_iter()
        .map(|(record, stats)| AdminSession { record, stats })
        .collect();

    Ok(Json(sessions))
}

/// Client auth: an empty client list means open access.
fn authenticate_client(headers: &HeaderMap, clients: &[Credentials]) -> Result<(), ApiError> {
    if clients.is_empty() {
        return Ok(());
    }
    check_basic_auth(headers, clients)
}

/// Admin auth: no admins configured means the surface stays locked.
fn authenticate_admin(headers: &HeaderMap, admins: &[Credentials]) -> Result<(), ApiError> {
    if admins.is_empty() {
        return Err(ApiError::unauthorized().with_message("Admin access not configured"));
    }
    check_basic_auth(headers, admins)
}

fn check_basic_auth(headers: &HeaderMap, allowed: &[Credentials]) -> Result<(), ApiError> {
    let Some((username, password)) = basic_credentials(headers) else {
        return Err(ApiError::unauthorized().with_message("Basic auth required"));
    };

    let found = allowed
        .iter()
        .any(|c| c.username == username && c.password == password);
    if found {
        Ok(())
    } else {
        Err(ApiError::unauthorized().with_message("Invalid username or password"))
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "failed to decode request body");
        ApiError::bad_request().with_message("Invalid json")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    fn clients() -> Vec<Credentials> {
        vec![Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }]
    }

    #[test]
    fn open_access_without_client_list() {
        assert!(authenticate_client(&HeaderMap::new(), &[]).is_ok());
    }

    #[test]
    fn accepts_valid_basic_credentials() {
        // "alice:secret"
        let headers = header_map("Basic YWxpY2U6c2VjcmV0");
        assert!(authenticate_client(&headers, &clients()).is_ok());
    }

    #[test]
    fn rejects_wrong_password() {
        // "alice:wrong"
        let headers = header_map("Basic YWxpY2U6d3Jvbmc=");
        let err = authenticate_client(&headers, &clients()).unwrap_err();
        assert_eq!(err.result, "UNAUTHORIZED");
    }

    #[test]
    fn rejects_missing_header_when_clients_configured() {
        let err = authenticate_client(&HeaderMap::new(), &clients()).unwrap_err();
        assert_eq!(err.result, "UNAUTHORIZED");
        assert_eq!(err.message, "Basic auth required");
    }

    #[test]
    fn admin_surface_is_locked_without_admins() {
        let err = authenticate_admin(&HeaderMap::new(), &[]).unwrap_err();
        assert_eq!(err.result, "UNAUTHORIZED");
    }
}
