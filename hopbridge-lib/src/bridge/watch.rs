use std::time::Duration;

use super::next_hop::CallError;
use super::protocol::{WatchReply, WatchRequest};
use super::{ApiError, Bridge};

/// The only operation-level deadline in the protocol.
const WATCH_TIMEOUT: Duration = Duration::from_secs(20);

impl Bridge {
    /// Liveness probe relayed along the chain with a hard per-hop deadline.
    pub async fn watch(&self, request: WatchRequest) -> Result<WatchReply, ApiError> {
        tracing::info!(session_id = %request.session_id, "watch request");

        let upstream_url = self.upstream_url(&request.session_id)?;

        match self
            .next_hop
            .call(&upstream_url, "watch", &request, Some(WATCH_TIMEOUT))
            .await
        {
            Ok(reply) => Ok(reply),
            Err(CallError::Remote(e)) => Err(e),
            Err(e) => Err(ApiError::internal_server_error().with_error(e)),
        }
    }
}
