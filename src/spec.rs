//! Data models for sandbox specifications and operation results.
//!
//! `SandboxSpec` is the single input to the lifecycle controller. It is loaded
//! either from a `k7.yaml` file (unknown keys rejected) or from an HTTP
//! request body (unknown keys silently dropped, for forward compatibility).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Keys accepted by the HTTP create path. Anything else in the body is
/// dropped before deserialization so older/newer clients interoperate.
const SPEC_KEYS: &[&str] = &[
    "name",
    "image",
    "namespace",
    "env_file",
    "egress_whitelist",
    "limits",
    "before_script",
    "pod_non_root",
    "container_non_root",
    "cap_drop",
    "cap_add",
    "runtime_class_name",
];

fn default_namespace() -> String {
    "default".to_string()
}

/// A sandbox specification, immutable after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Path to a local KEY=VALUE file turned into the `<name>-env` secret.
    #[serde(default)]
    pub env_file: Option<String>,
    /// Tri-state egress control; see [`Egress`].
    #[serde(default)]
    pub egress_whitelist: Option<Vec<String>>,
    /// Resource quantities, applied as both requests and limits.
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
    /// Shell snippet that must complete before the sandbox is Ready.
    #[serde(default)]
    pub before_script: String,
    /// Run the pod with non-root defaults (uid/gid/fsGroup 65532).
    #[serde(default)]
    pub pod_non_root: bool,
    /// Run the main container as uid 65532 with `runAsNonRoot`.
    #[serde(default)]
    pub container_non_root: bool,
    /// Capabilities to drop; `None` means drop ALL.
    #[serde(default)]
    pub cap_drop: Option<Vec<String>>,
    /// Capabilities to add back.
    #[serde(default)]
    pub cap_add: Option<Vec<String>>,
    #[serde(default)]
    pub runtime_class_name: Option<String>,
}

/// Egress connectivity for a sandbox.
///
/// Absence of a whitelist, an empty whitelist, and a non-empty whitelist all
/// mean different things; a nullable list alone cannot express this, so the
/// builder and controller work with this enum instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
    /// No whitelist given: no egress policy is created at all.
    Open,
    /// Empty whitelist: block all egress except DNS.
    BlockAll,
    /// Block all egress except the listed CIDRs plus DNS.
    Allow(Vec<String>),
}

impl SandboxSpec {
    /// Load a spec from a `k7.yaml` file. Unknown keys are an error.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read spec file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse spec file: {}", path.display()))
    }

    /// Build a spec from an HTTP request body, dropping unknown keys.
    pub fn from_json_lenient(value: &serde_json::Value) -> Result<Self> {
        let filtered: serde_json::Map<String, serde_json::Value> = value
            .as_object()
            .context("Request body must be a JSON object")?
            .iter()
            .filter(|(k, _)| SPEC_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(serde_json::Value::Object(filtered))
            .context("Invalid sandbox specification")
    }

    pub fn egress(&self) -> Egress {
        match &self.egress_whitelist {
            None => Egress::Open,
            Some(cidrs) if cidrs.is_empty() => Egress::BlockAll,
            Some(cidrs) => Egress::Allow(cidrs.clone()),
        }
    }

    pub fn runtime_class(&self) -> &str {
        self.runtime_class_name.as_deref().unwrap_or("kata")
    }

    pub fn env_secret_name(&self) -> String {
        format!("{}-env", self.name)
    }

    pub fn egress_policy_name(&self) -> String {
        format!("{}-netpol", self.name)
    }

    pub fn ingress_policy_name(&self) -> String {
        format!("{}-deny-ingress", self.name)
    }
}

/// User-facing view of one sandbox, reconstructed from cluster objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub ready: String,
    pub restarts: i32,
    pub age: String,
    pub image: String,
    #[serde(default)]
    pub error_message: String,
}

/// Result of running a command inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Outcome of a lifecycle operation. Controllers return this instead of
/// erroring so partial cluster state is always reported, never thrown away.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
