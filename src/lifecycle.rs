//! Sandbox lifecycle controller.
//!
//! Drives creation through provision, init-wait, egress lockdown, and
//! ingress deny, reporting each transition to the caller's progress sink.
//! On failure nothing is rolled back: the partial state stays visible in
//! the cluster and `delete_sandbox` is the cleanup path.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::aggregator::{self, pod_is_ready};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::progress::{ProgressEvent, ProgressSink, Stage, Status};
use crate::resources;
use crate::spec::{Egress, OperationResult, SandboxSpec};
use crate::validation;

/// How long to wait for the before-script to drive the pod Ready.
const INIT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
/// Interval between pod readiness polls during init-wait.
const INIT_WAIT_POLL: Duration = Duration::from_secs(2);

/// Per-sandbox entry in the bulk-delete report.
#[derive(Debug, Clone, Serialize)]
struct DeleteReport {
    name: String,
    success: bool,
    error: Option<String>,
}

/// Owns the create/delete workflows. Cheap to clone via the shared gateway;
/// all sandbox state lives in the cluster.
pub struct SandboxController {
    gateway: Arc<dyn Gateway>,
}

impl SandboxController {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &dyn Gateway {
        self.gateway.as_ref()
    }

    /// Create a sandbox, reporting progress to `sink`. Never fails with an
    /// `Err`; every outcome is an `OperationResult`.
    pub async fn create_sandbox(
        &self,
        spec: &SandboxSpec,
        sink: Option<&ProgressSink>,
    ) -> OperationResult {
        match self.run_create(spec, sink).await {
            Ok(message) => OperationResult::ok(message),
            Err(err) => {
                emit(sink, ProgressEvent::fatal(err.to_string()));
                OperationResult::err(err.to_string())
            }
        }
    }

    async fn run_create(&self, spec: &SandboxSpec, sink: Option<&ProgressSink>) -> Result<String> {
        validation::validate_sandbox_name(&spec.name)?;
        validation::validate_limits(spec)?;

        emit(sink, ProgressEvent::new(Stage::Provisioning, Status::Start));
        self.provision(spec).await?;
        emit(sink, ProgressEvent::new(Stage::Provisioning, Status::Done));

        self.wait_for_init(spec, sink).await;

        self.lock_egress(spec, sink).await?;
        self.deny_ingress(spec, sink).await?;

        let message = format!("Sandbox {} created successfully", spec.name);
        info!(sandbox = %spec.name, namespace = %spec.namespace, "sandbox created");
        emit(
            sink,
            ProgressEvent::new(Stage::Complete, Status::Success).with_message(message.clone()),
        );
        Ok(message)
    }

    /// Create the env secret (if any) and the workload. Secret name
    /// collisions are tolerated; workload collisions are a conflict.
    async fn provision(&self, spec: &SandboxSpec) -> Result<()> {
        if let Some(env_file) = &spec.env_file {
            let content = std::fs::read_to_string(env_file).map_err(|err| {
                Error::Validation(format!("Failed to read env file {}: {}", env_file, err))
            })?;
            let vars = resources::parse_env_file(&content)?;
            let secret = resources::build_env_secret(spec, vars);
            match self.gateway.create_secret(&spec.namespace, &secret).await {
                Ok(()) => {}
                Err(err) if err.is_conflict() => {}
                Err(err) => {
                    return Err(Error::Cluster(format!("Failed to create secret: {}", err)));
                }
            }
        }

        let workload = resources::build_workload(spec);
        match self.gateway.create_workload(&spec.namespace, &workload).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => Err(Error::Conflict(format!(
                "Sandbox {} already exists",
                spec.name
            ))),
            Err(err) => Err(Error::Cluster(format!(
                "Failed to create deployment: {}",
                err
            ))),
        }
    }

    /// Wait for the pod to report Ready after its before-script. Hitting
    /// the ceiling is not a failure; the sandbox just is not Ready yet and
    /// listing will show that.
    async fn wait_for_init(&self, spec: &SandboxSpec, sink: Option<&ProgressSink>) {
        if spec.before_script.trim().is_empty() {
            emit(sink, ProgressEvent::new(Stage::BeforeScript, Status::Skipped));
            return;
        }

        emit(
            sink,
            ProgressEvent::new(Stage::BeforeScript, Status::Waiting)
                .with_script(spec.before_script.clone()),
        );

        let selector = format!("app={}", spec.name);
        let deadline = Instant::now() + INIT_WAIT_TIMEOUT;
        loop {
            match self.gateway.list_pods(&spec.namespace, &selector).await {
                Ok(pods) => {
                    let ready = pods.first().map(pod_is_ready).unwrap_or(false);
                    if ready {
                        break;
                    }
                }
                Err(err) => {
                    warn!(sandbox = %spec.name, %err, "pod poll failed during init wait");
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    sandbox = %spec.name,
                    timeout_secs = INIT_WAIT_TIMEOUT.as_secs(),
                    "init wait timed out; sandbox may not be Ready yet"
                );
                break;
            }
            tokio::time::sleep(INIT_WAIT_POLL).await;
        }

        emit(sink, ProgressEvent::new(Stage::BeforeScript, Status::Done));
    }

    /// Apply the egress policy, strictly after init-wait so the script ran
    /// with the cluster's default connectivity.
    async fn lock_egress(&self, spec: &SandboxSpec, sink: Option<&ProgressSink>) -> Result<()> {
        let cidrs = match spec.egress() {
            Egress::Open => {
                emit(
                    sink,
                    ProgressEvent::new(Stage::NetworkLockdown, Status::Skipped),
                );
                return Ok(());
            }
            Egress::BlockAll => Vec::new(),
            Egress::Allow(cidrs) => cidrs,
        };

        emit(
            sink,
            ProgressEvent::new(Stage::NetworkLockdown, Status::Applying),
        );
        let policy = resources::build_egress_policy(spec, &cidrs);
        match self
            .gateway
            .create_network_policy(&spec.namespace, &policy)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {}
            Err(err) => {
                return Err(Error::Cluster(format!(
                    "Failed to create network policy: {}",
                    err
                )));
            }
        }
        emit(sink, ProgressEvent::new(Stage::NetworkLockdown, Status::Done));
        Ok(())
    }

    /// Ingress is always denied; an existing policy counts as success.
    async fn deny_ingress(&self, spec: &SandboxSpec, sink: Option<&ProgressSink>) -> Result<()> {
        let policy = resources::build_ingress_deny_policy(spec);
        match self
            .gateway
            .create_network_policy(&spec.namespace, &policy)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => {
                emit(
                    sink,
                    ProgressEvent::new(Stage::NetworkLockdown, Status::Exists)
                        .with_policy(spec.ingress_policy_name()),
                );
                Ok(())
            }
            Err(err) => {
                let error = format!("Failed to create ingress deny policy: {}", err);
                emit(
                    sink,
                    ProgressEvent::new(Stage::NetworkLockdown, Status::Error)
                        .with_error(error.clone()),
                );
                Err(Error::Cluster(error))
            }
        }
    }

    /// Delete every derived object of a sandbox. Each delete is independent
    /// and a missing object is fine, which makes the whole cascade
    /// idempotent.
    pub async fn delete_sandbox(&self, name: &str, namespace: &str) -> OperationResult {
        let secret = format!("{}-env", name);
        let egress_policy = format!("{}-netpol", name);
        let ingress_policy = format!("{}-deny-ingress", name);

        let mut errors = Vec::new();
        let mut record = |kind: &str, result: Result<()>| {
            if let Err(err) = result {
                if !err.is_not_found() {
                    errors.push(format!("{}: {}", kind, err));
                }
            }
        };

        record(
            "deployment",
            self.gateway.delete_workload(namespace, name).await,
        );
        record(
            "secret",
            self.gateway.delete_secret(namespace, &secret).await,
        );
        record(
            "network policy",
            self.gateway
                .delete_network_policy(namespace, &egress_policy)
                .await,
        );
        record(
            "network policy deny-ingress",
            self.gateway
                .delete_network_policy(namespace, &ingress_policy)
                .await,
        );

        if errors.is_empty() {
            info!(sandbox = %name, namespace, "sandbox deleted");
            OperationResult::ok(format!("Sandbox {} deleted successfully", name))
        } else {
            OperationResult::err(errors.join("; "))
        }
    }

    /// Delete every sandbox in a namespace, reporting per-sandbox outcomes.
    pub async fn delete_all_sandboxes(&self, namespace: &str) -> OperationResult {
        let workloads =
            match aggregator::sandbox_workloads(self.gateway.as_ref(), Some(namespace)).await {
                Ok(workloads) => workloads,
                Err(err) => return OperationResult::err(err.to_string()),
            };

        let mut reports = Vec::with_capacity(workloads.len());
        for workload in workloads {
            let Some(name) = workload.metadata.name.clone() else {
                continue;
            };
            let result = self.delete_sandbox(&name, namespace).await;
            reports.push(DeleteReport {
                name,
                success: result.success,
                error: (!result.success).then_some(result.error),
            });
        }

        let failed = reports.iter().filter(|report| !report.success).count();
        let data = serde_json::to_value(&reports).unwrap_or_default();
        if failed > 0 {
            OperationResult::err(format!("Failed to delete {} sandboxes", failed)).with_data(data)
        } else {
            OperationResult::ok(format!("Deleted {} sandboxes", reports.len())).with_data(data)
        }
    }
}

fn emit(sink: Option<&ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = sink {
        sink(&event);
    }
}
