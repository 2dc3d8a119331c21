//! Outstanding permission requests raised by a backend.
//!
//! Each driver parks the information it needs to answer a request (a
//! JSON-RPC id, the original tool input, ...) here until the user decides.
//! The gate also carries the driver's permission mode so that requests raised
//! after a switch to bypass are answered on the spot.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_bridge_core::PermissionMode;

/// What to do with a newly raised request.
#[derive(Debug)]
pub enum Admission<R> {
    /// Parked; surface a `permission` event.
    Surface,
    /// Bypass mode; answer with allow immediately.
    AutoAllow(R),
}

/// Permission table plus mode.
#[derive(Debug)]
pub struct PermissionGate<R> {
    mode: Mutex<PermissionMode>,
    pending: Mutex<HashMap<String, R>>,
}

impl<R> Default for PermissionGate<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> PermissionGate<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(PermissionMode::Default),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, R>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn mode(&self) -> PermissionMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies to requests admitted after this call.
    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Admit a request under the current mode.
    pub fn admit(&self, request_id: impl Into<String>, reply: R) -> Admission<R> {
        if self.mode() == PermissionMode::Bypass {
            return Admission::AutoAllow(reply);
        }
        self.table().insert(request_id.into(), reply);
        Admission::Surface
    }

    /// Remove a request for answering. `None` if unknown or already taken.
    pub fn take(&self, request_id: &str) -> Option<R> {
        self.table().remove(request_id)
    }

    /// Remove every request.
    pub fn drain(&self) -> Vec<(String, R)> {
        self.table().drain().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

/// Claude's answer to a `can_use_tool` control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "camelCase")]
pub enum PermissionResult {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt: Option<bool>,
    },
}

impl PermissionResult {
    /// Denial sent for requests still open when a turn is interrupted.
    #[must_use]
    pub fn interrupted() -> Self {
        Self::Deny {
            message: "Turn interrupted by user".into(),
            interrupt: Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn requests_are_taken_exactly_once() {
        let gate = PermissionGate::new();
        assert!(matches!(gate.admit("r1", 7), Admission::Surface));
        assert_eq!(gate.len(), 1);
        assert_eq!(gate.take("r1"), Some(7));
        assert_eq!(gate.take("r1"), None);
        assert!(gate.is_empty());
    }

    #[test]
    fn bypass_applies_only_to_later_requests() {
        let gate = PermissionGate::new();
        assert!(matches!(gate.admit("before", 1), Admission::Surface));

        gate.set_mode(PermissionMode::Bypass);
        assert!(matches!(gate.admit("after", 2), Admission::AutoAllow(2)));

        assert_eq!(gate.drain(), vec![("before".to_string(), 1)]);
    }

    #[test]
    fn permission_result_wire_shape() {
        let allow = PermissionResult::Allow {
            updated_input: json!({"command": "ls"}),
        };
        assert_eq!(
            serde_json::to_value(allow).unwrap(),
            json!({"behavior": "allow", "updatedInput": {"command": "ls"}})
        );
        assert_eq!(
            serde_json::to_value(PermissionResult::interrupted()).unwrap()["interrupt"],
            true
        );
    }
}
