//! Listing and metrics projection.
//!
//! Reconstructs the user-facing sandbox view from the underlying cluster
//! objects: kata-labelled workloads joined with their first pod. Listing is
//! best-effort by design; a top-level failure yields an empty list, and a
//! per-sandbox pod lookup failure degrades that row to `status: "Error"`.

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::gateway::Gateway;
use crate::spec::SandboxInfo;

/// Resource usage of one sandbox; quantity strings are passed through raw
/// and parsed by the consumer (see [`cpu_cores`] and [`memory_mib`]).
#[derive(Debug, Clone, Serialize)]
pub struct SandboxMetrics {
    pub name: String,
    pub namespace: String,
    pub cpu_usage: String,
    pub memory_usage: String,
}

/// A workload counts as a sandbox when its pod template asks for the kata
/// runtime class, or its labels carry `runtime=kata`.
fn is_sandbox(workload: &Deployment) -> bool {
    let template_runtime = workload
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.runtime_class_name.as_deref());
    if template_runtime == Some("kata") {
        return true;
    }
    workload
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("runtime"))
        .map(|runtime| runtime == "kata")
        .unwrap_or(false)
}

pub(crate) async fn sandbox_workloads(
    gateway: &dyn Gateway,
    namespace: Option<&str>,
) -> crate::error::Result<Vec<Deployment>> {
    let workloads = gateway.list_workloads(namespace).await?;
    Ok(workloads.into_iter().filter(is_sandbox).collect())
}

/// Whether a pod carries a `Ready=True` condition.
pub(crate) fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn format_age(pod: &Pod) -> String {
    let Some(created) = pod.metadata.creation_timestamp.as_ref() else {
        return "Unknown".to_string();
    };
    let age = Utc::now().signed_duration_since(created.0);
    let seconds = age.num_seconds().max(0) as u64;
    humantime::format_duration(Duration::from_secs(seconds)).to_string()
}

fn info_from_pod(name: &str, namespace: &str, pod: Option<&Pod>) -> SandboxInfo {
    let Some(pod) = pod else {
        return SandboxInfo {
            name: name.to_string(),
            namespace: namespace.to_string(),
            status: "No Pods".to_string(),
            ready: "False".to_string(),
            restarts: 0,
            age: "Unknown".to_string(),
            image: "Unknown".to_string(),
            error_message: String::new(),
        };
    };

    let status = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let restarts = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|cs| cs.restart_count).sum())
        .unwrap_or(0);
    let image = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.image.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    SandboxInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        status,
        ready: if pod_is_ready(pod) { "True" } else { "False" }.to_string(),
        restarts,
        age: format_age(pod),
        image,
        error_message: String::new(),
    }
}

fn error_info(name: &str, namespace: &str) -> SandboxInfo {
    SandboxInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        status: "Error".to_string(),
        ready: "False".to_string(),
        restarts: 0,
        age: "Unknown".to_string(),
        image: "Unknown".to_string(),
        error_message: String::new(),
    }
}

/// List all sandboxes, joined with their first pod's status.
pub async fn list_sandboxes(gateway: &dyn Gateway, namespace: Option<&str>) -> Vec<SandboxInfo> {
    let workloads = match sandbox_workloads(gateway, namespace).await {
        Ok(workloads) => workloads,
        Err(err) => {
            warn!(%err, "failed to list sandboxes");
            return Vec::new();
        }
    };

    let mut sandboxes = Vec::with_capacity(workloads.len());
    for workload in workloads {
        let Some(name) = workload.metadata.name.clone() else {
            continue;
        };
        let ns = workload
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let info = match gateway.list_pods(&ns, &format!("app={}", name)).await {
            Ok(pods) => info_from_pod(&name, &ns, pods.first()),
            Err(err) => {
                warn!(sandbox = %name, namespace = %ns, %err, "pod lookup failed");
                error_info(&name, &ns)
            }
        };
        sandboxes.push(info);
    }
    sandboxes
}

/// Collect resource usage for every sandbox with a `Running` pod.
/// Sandboxes whose pod or metrics lookup fails are skipped.
pub async fn get_metrics(gateway: &dyn Gateway, namespace: Option<&str>) -> Vec<SandboxMetrics> {
    let workloads = match sandbox_workloads(gateway, namespace).await {
        Ok(workloads) => workloads,
        Err(err) => {
            warn!(%err, "failed to list sandboxes for metrics");
            return Vec::new();
        }
    };

    let mut metrics = Vec::new();
    for workload in workloads {
        let Some(name) = workload.metadata.name.clone() else {
            continue;
        };
        let ns = workload
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let Ok(pods) = gateway.list_pods(&ns, &format!("app={}", name)).await else {
            continue;
        };
        let Some(pod) = pods.first() else {
            continue;
        };
        let running = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running");
        if !running {
            continue;
        }
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            continue;
        };

        match gateway.get_pod_metrics(&ns, pod_name).await {
            Ok(usage) => metrics.push(SandboxMetrics {
                name,
                namespace: ns,
                cpu_usage: usage.cpu,
                memory_usage: usage.memory,
            }),
            Err(err) => {
                warn!(sandbox = %name, namespace = %ns, %err, "metrics lookup failed");
            }
        }
    }
    metrics
}

/// Parse a CPU usage quantity (`n`, `u`, `m`, or whole cores) into cores.
pub fn cpu_cores(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let nanos: f64 = if let Some(value) = quantity.strip_suffix('n') {
        value.parse::<f64>().ok()?
    } else if let Some(value) = quantity.strip_suffix('u') {
        value.parse::<f64>().ok()? * 1_000.0
    } else if let Some(value) = quantity.strip_suffix('m') {
        value.parse::<f64>().ok()? * 1_000_000.0
    } else {
        quantity.parse::<f64>().ok()? * 1_000_000_000.0
    };
    Some(nanos / 1_000_000_000.0)
}

/// Parse a memory usage quantity (`Ki`, `Mi`, `Gi`, or bytes) into MiB.
pub fn memory_mib(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if let Some(value) = quantity.strip_suffix("Ki") {
        Some(value.parse::<f64>().ok()? / 1024.0)
    } else if let Some(value) = quantity.strip_suffix("Mi") {
        value.parse::<f64>().ok()
    } else if let Some(value) = quantity.strip_suffix("Gi") {
        Some(value.parse::<f64>().ok()? * 1024.0)
    } else {
        Some(quantity.parse::<f64>().ok()? / (1024.0 * 1024.0))
    }
}
