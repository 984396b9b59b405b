use std::time::Duration;

use super::next_hop::CallError;
use super::protocol::{UpdateReply, UpdateRequest};
use super::{ApiError, Bridge};

impl Bridge {
    /// Refreshes a session along the whole chain. The local expiry only
    /// moves once the next hop has accepted the update; a disconnect racing
    /// in between simply wins and the touch is dropped.
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateReply, ApiError> {
        tracing::info!(session_id = %request.session_id, "update request");

        let upstream_url = self.upstream_url(&request.session_id)?;

        let reply: UpdateReply = match self.next_hop.call(&upstream_url, "update", &request, None).await {
            Ok(reply) => reply,
            Err(CallError::Remote(e)) => return Err(e),
            Err(e) => return Err(ApiError::internal_server_error().with_error(e)),
        };

        if !self.store.touch(&request.session_id, Duration::from_secs(reply.ttl)) {
            tracing::debug!(session_id = %request.session_id, "session disappeared before expiry refresh");
        }

        Ok(reply)
    }
}
