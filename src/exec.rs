//! Command execution inside a running sandbox.
//!
//! Never returns an error: every failure is folded into the returned
//! [`ExecResult`] with exit code 1 and the message on stderr, so callers
//! (CLI, HTTP) always have a uniform shape to render.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::spec::ExecResult;

/// Run `command` under `/bin/sh -c` inside the sandbox's pod.
pub async fn exec_command(
    gateway: &dyn Gateway,
    name: &str,
    command: &str,
    namespace: &str,
) -> ExecResult {
    let started = Instant::now();
    match run(gateway, name, command, namespace).await {
        Ok((exit_code, stdout, stderr)) => ExecResult {
            exit_code,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(err) => ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: err.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        },
    }
}

async fn run(
    gateway: &dyn Gateway,
    name: &str,
    command: &str,
    namespace: &str,
) -> Result<(i32, String, String)> {
    gateway
        .read_workload(namespace, name)
        .await
        .map_err(|err| match err {
            Error::NotFound(_) => Error::NotFound(format!("Sandbox {} not found", name)),
            other => Error::Cluster(format!("Failed to get deployment: {}", other)),
        })?;

    let pods = gateway
        .list_pods(namespace, &format!("app={}", name))
        .await?;
    let pod = pods
        .first()
        .ok_or_else(|| Error::NotFound(format!("No pods found for sandbox {}", name)))?;

    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    if phase != "Running" {
        return Err(Error::Cluster(format!(
            "Pod is not running (status: {})",
            phase
        )));
    }

    let pod_name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::Cluster("pod has no name".to_string()))?;

    let argv = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ];
    let output = gateway.exec_pod(namespace, pod_name, &argv).await?;

    Ok((
        output.exit_code,
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}
