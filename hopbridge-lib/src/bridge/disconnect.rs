use super::next_hop::CallError;
use super::protocol::{DisconnectReply, DisconnectRequest, RESULT_OK};
use super::{ApiError, Bridge};

impl Bridge {
    /// Tears the session down locally and propagates the disconnect. Local
    /// teardown failures are logged and swallowed so the rest of the chain
    /// still learns about the disconnect.
    pub async fn disconnect(&self, request: DisconnectRequest) -> Result<DisconnectReply, ApiError> {
        tracing::info!(session_id = %request.session_id, "disconnect request");

        let session = self
            .store
            .remove(&request.session_id)
            .ok_or_else(ApiError::session_not_found)?;

        self.teardown(&session).await;

        let _: DisconnectReply = match self
            .next_hop
            .call(session.record.upstream_url(), "disconnect", &request, None)
            .await
        {
            Ok(reply) => reply,
            Err(CallError::Remote(e)) => return Err(e),
            Err(e) => return Err(ApiError::internal_server_error().with_error(e)),
        };

        Ok(DisconnectReply {
            result: RESULT_OK.to_string(),
        })
    }
}
