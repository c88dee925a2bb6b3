//! Progress events emitted during sandbox creation.
//!
//! The lifecycle controller reports each stage transition through a
//! caller-supplied sink. The sink is fire-and-forget: it returns nothing,
//! and the controller never depends on its behavior.

use serde::Serialize;

/// Creation stages, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Provisioning,
    BeforeScript,
    NetworkLockdown,
    Complete,
    Error,
}

/// Per-stage status markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Start,
    Done,
    Waiting,
    Skipped,
    Applying,
    Exists,
    Error,
    Success,
}

/// One progress event. Serializes to the wire shape consumed by the CLI
/// spinner and the HTTP streaming adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, status: Status) -> Self {
        Self {
            stage,
            status: Some(status),
            script: None,
            policy: None,
            message: None,
            error: None,
        }
    }

    /// Terminal failure event; carries no status, only the error text.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            stage: Stage::Error,
            status: None,
            script: None,
            policy: None,
            message: None,
            error: Some(error.into()),
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Caller-supplied event sink. Called synchronously from the controller's
/// task; must tolerate concurrent creates each driving their own sink.
pub type ProgressSink = dyn Fn(&ProgressEvent) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent::new(Stage::BeforeScript, Status::Waiting)
            .with_script("apk add curl");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "before_script");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["script"], "apk add curl");
        assert!(json.get("policy").is_none());
    }

    #[test]
    fn test_fatal_event_has_no_status() {
        let event = ProgressEvent::fatal("boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "error");
        assert_eq!(json["error"], "boom");
        assert!(json.get("status").is_none());
    }
}
