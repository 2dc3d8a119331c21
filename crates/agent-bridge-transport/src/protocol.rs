//! Wire protocol between clients and the bridge.
//!
//! Clients send [`ClientRequest`]s: a session [`Command`] tagged by `type`,
//! optionally carrying a `requestId` that the bridge echoes in its
//! [`Reply`]. Everything else the bridge sends is a [`ClientEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use agent_bridge_core::ClientEvent;
use agent_bridge_session::{Command, CommandReply};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: Command,
}

impl ClientRequest {
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            request_id: None,
            command,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Outcome of one client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "reply", rename_all = "camelCase")]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    #[must_use]
    pub const fn ok(request_id: Option<String>, result: Option<Value>) -> Self {
        Self {
            request_id,
            ok: true,
            result,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: Option<String>, error: impl std::fmt::Display) -> Self {
        Self {
            request_id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(ClientEvent),
    Reply(Reply),
}

impl From<ClientEvent> for ServerMessage {
    fn from(event: ClientEvent) -> Self {
        Self::Event(event)
    }
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

/// Split a command reply into the messages sent back to the requester.
///
/// Snapshots (`history`, `agentList`) travel as their own events ahead of
/// the bare acknowledgement.
#[must_use]
pub fn reply_messages(request_id: Option<String>, reply: CommandReply) -> Vec<ServerMessage> {
    match reply {
        CommandReply::Spawned(agent) => {
            let result = serde_json::to_value(&agent).ok().map(|agent| json!({ "agent": agent }));
            vec![Reply::ok(request_id, result).into()]
        }
        CommandReply::Answered(answered) => {
            vec![Reply::ok(request_id, Some(json!({ "answered": answered }))).into()]
        }
        CommandReply::History(history) => vec![history.into(), Reply::ok(request_id, None).into()],
        CommandReply::Agents(agents) => vec![
            ClientEvent::AgentList { agents }.into(),
            Reply::ok(request_id, None).into(),
        ],
        CommandReply::Done => vec![Reply::ok(request_id, None).into()],
    }
}

#[cfg(test)]
mod tests {
    use agent_bridge_core::PermissionMode;

    use super::*;

    #[test]
    fn request_id_sits_beside_the_command_tag() {
        let request: ClientRequest = serde_json::from_str(
            r#"{"type":"setPermissionMode","requestId":"7","agentId":"a1","mode":"bypass"}"#,
        )
        .unwrap();
        assert_eq!(request.request_id.as_deref(), Some("7"));
        assert_eq!(
            request.command,
            Command::SetPermissionMode {
                agent_id: "a1".into(),
                mode: PermissionMode::Bypass
            }
        );

        let bare: ClientRequest = serde_json::from_str(r#"{"type":"listAgents"}"#).unwrap();
        assert_eq!(bare, ClientRequest::new(Command::ListAgents));
    }

    #[test]
    fn replies_and_events_share_one_stream() {
        let reply: ServerMessage = Reply::error(Some("9".into()), "Agent not found: x").into();
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["ok"], false);
        assert_eq!(serde_json::from_value::<ServerMessage>(json).unwrap(), reply);

        let chunk: ServerMessage = ClientEvent::StreamChunk {
            agent_id: "a1".into(),
            text: "Hi".into(),
        }
        .into();
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains(r#""type":"streamChunk""#));
        assert_eq!(serde_json::from_str::<ServerMessage>(&json).unwrap(), chunk);
    }

    #[test]
    fn list_reply_carries_the_snapshot_first() {
        let messages = reply_messages(Some("1".into()), CommandReply::Agents(Vec::new()));
        assert!(matches!(
            &messages[0],
            ServerMessage::Event(ClientEvent::AgentList { agents }) if agents.is_empty()
        ));
        assert!(matches!(&messages[1], ServerMessage::Reply(Reply { ok: true, .. })));
    }
}
