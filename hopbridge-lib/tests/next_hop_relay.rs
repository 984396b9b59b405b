use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use url::Url;

use hopbridge_lib::bridge::NextHopClient;
use hopbridge_lib::bridge::next_hop::CallError;
use hopbridge_lib::bridge::protocol::{UpdateReply, UpdateRequest};

async fn spawn_stub(app: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/").parse().unwrap()
}

#[tokio::test]
async fn relays_a_successful_reply() {
    let app = Router::new().route(
        "/wireguard/update",
        post(|| async { Json(json!({"result": "OK", "ttl": 180})) }),
    );
    let hop = spawn_stub(app).await;

    let client = NextHopClient::new(None).unwrap();
    let reply: UpdateReply = client
        .call(&hop, "update", &UpdateRequest::default(), None)
        .await
        .unwrap();

    assert_eq!(reply.result, "OK");
    assert_eq!(reply.ttl, 180);
}

#[tokio::test]
async fn prefixes_and_preserves_next_hop_errors() {
    let app = Router::new().route(
        "/wireguard/update",
        post(|| async {
            (
                StatusCode::FORBIDDEN,
                Json(json!({"result": "FORBIDDEN", "error": "nope"})),
            )
        }),
    );
    let hop = spawn_stub(app).await;

    let client = NextHopClient::new(None).unwrap();
    let result = client
        .call::<_, UpdateReply>(&hop, "update", &UpdateRequest::default(), None)
        .await;

    match result {
        Err(CallError::Remote(err)) => {
            assert_eq!(err.status, StatusCode::FORBIDDEN);
            assert_eq!(err.result, "FORBIDDEN");
            assert!(err.message.starts_with("Error from "));
            assert!(err.message.contains("nope"));
        }
        other => panic!("expected a relayed error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_error_bodies_are_reported_as_reply_errors() {
    let app = Router::new().route(
        "/wireguard/update",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "not json") }),
    );
    let hop = spawn_stub(app).await;

    let client = NextHopClient::new(None).unwrap();
    let result = client
        .call::<_, UpdateReply>(&hop, "update", &UpdateRequest::default(), None)
        .await;

    assert!(matches!(result, Err(CallError::Reply(_))));
}

#[tokio::test]
async fn unreachable_hops_fail_with_a_transport_error() {
    // bind and immediately drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let hop: Url = format!("http://{addr}/").parse().unwrap();
    let client = NextHopClient::new(None).unwrap();
    let result = client
        .call::<_, UpdateReply>(&hop, "update", &UpdateRequest::default(), None)
        .await;

    assert!(matches!(result, Err(CallError::Transport(_))));
}
