//! Claude Code control protocol peer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;

use agent_bridge_core::PermissionMode;

use super::types::{
    ControlResponseMessage, ControlResponseType, SdkControlRequest, SdkControlRequestType,
    UserPrompt, cli_permission_mode,
};
use crate::{
    codec::{CodecError, FrameWriter},
    permissions::PermissionResult,
    rpc::{PendingCalls, RequestId, RpcError},
};

/// Writes frames to the CLI and tracks our outstanding control requests.
#[derive(Clone)]
pub struct ProtocolPeer {
    writer: FrameWriter,
    controls: Arc<PendingCalls>,
    next_request: Arc<AtomicU64>,
}

impl ProtocolPeer {
    #[must_use]
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer,
            controls: Arc::new(PendingCalls::default()),
            next_request: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send a user message.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send_user_message(
        &self,
        content: &str,
        session_id: Option<String>,
    ) -> Result<(), CodecError> {
        self.writer.send(&UserPrompt::new(content, session_id)).await
    }

    /// Answer a `can_use_tool` request.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send_permission_result(
        &self,
        request_id: String,
        result: &PermissionResult,
    ) -> Result<(), CodecError> {
        let response = serde_json::to_value(result)?;
        self.send_success(request_id, response).await
    }

    /// Send a successful control response.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send_success(&self, request_id: String, response: Value) -> Result<(), CodecError> {
        self.writer
            .send(&ControlResponseMessage::new(ControlResponseType::Success {
                request_id,
                response: Some(response),
            }))
            .await
    }

    /// Send a failed control response.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send_error(&self, request_id: String, error: String) -> Result<(), CodecError> {
        self.writer
            .send(&ControlResponseMessage::new(ControlResponseType::Error {
                request_id,
                error: Some(error),
            }))
            .await
    }

    /// Ask the CLI to stop the current turn and wait for its acknowledgement.
    ///
    /// # Errors
    /// Returns error if the write fails, the CLI rejects the request, or no
    /// answer arrives within `timeout`.
    pub async fn interrupt(&self, timeout: Duration) -> Result<Value, RpcError> {
        self.control(SdkControlRequestType::Interrupt {}, "interrupt", timeout)
            .await
    }

    /// Forward a permission mode change.
    ///
    /// # Errors
    /// See [`ProtocolPeer::interrupt`].
    pub async fn set_permission_mode(
        &self,
        mode: PermissionMode,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.control(
            SdkControlRequestType::SetPermissionMode {
                mode: cli_permission_mode(mode),
            },
            "set_permission_mode",
            timeout,
        )
        .await
    }

    async fn control(
        &self,
        request: SdkControlRequestType,
        name: &str,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let rx = self.controls.register(id);

        if let Err(e) = self
            .writer
            .send(&SdkControlRequest::new(control_request_id(id), request))
            .await
        {
            self.controls.remove(id);
            return Err(RpcError::Transport(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                self.controls.remove(id);
                Err(RpcError::Timeout(name.to_string()))
            }
        }
    }

    /// Route a `control_response` to the request that is waiting for it.
    pub fn on_control_response(&self, response: ControlResponseType) {
        let Some(id) = parse_control_request_id(response.request_id()) else {
            tracing::debug!(request_id = response.request_id(), "Control response for foreign id");
            return;
        };
        let outcome = match response {
            ControlResponseType::Success { response, .. } => Ok(response.unwrap_or(Value::Null)),
            ControlResponseType::Error { error, .. } => Err(RpcError::Remote {
                code: crate::rpc::INTERNAL_ERROR,
                message: error.unwrap_or_else(|| "control request failed".into()),
                data: None,
            }),
        };
        if !self.controls.resolve(id, outcome) {
            tracing::debug!(id, "Control response for unknown request");
        }
    }

    /// Number of control requests awaiting an answer.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.controls.len()
    }

    /// Reject outstanding control requests and close the socket writer.
    pub async fn close(&self) -> usize {
        let rejected = self.controls.reject_all();
        self.writer.close().await;
        rejected
    }
}

fn control_request_id(id: RequestId) -> String {
    format!("req_{id}")
}

fn parse_control_request_id(raw: &str) -> Option<RequestId> {
    raw.strip_prefix("req_")?.parse().ok()
}
