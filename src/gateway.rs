//! Typed gateway over the cluster API.
//!
//! The [`Gateway`] trait is the seam between the sandbox core and the
//! cluster: the lifecycle controller, exec channel, and aggregator only ever
//! talk to this trait. [`KubeGateway`] is the production implementation,
//! holding one lazily-connected `kube::Client` shared by all calls.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncReadExt};
use tokio::sync::OnceCell;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Well-known kubeconfig location on k3s nodes.
const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/// Demuxed output of a finished pod exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Options for pod log streaming.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub container: Option<String>,
    pub since: Option<Duration>,
    pub tail_lines: Option<i64>,
    pub follow: bool,
}

/// One resource-usage sample for a pod, raw quantity strings as reported
/// by the metrics API (`n`/`u`/`m` CPU, `Ki`/`Mi`/`Gi` memory).
#[derive(Debug, Clone)]
pub struct PodUsage {
    pub cpu: String,
    pub memory: String,
}

pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Typed operations against the cluster. All methods are safe to call
/// concurrently; state lives in the cluster, not in the gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn create_workload(&self, namespace: &str, workload: &Deployment) -> Result<()>;
    async fn read_workload(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;
    /// List workloads in one namespace, or cluster-wide when `None`.
    async fn list_workloads(&self, namespace: Option<&str>) -> Result<Vec<Deployment>>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()>;
    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Run `argv` inside a pod, pumping stdout/stderr until the stream
    /// closes, and recover the exit code from the terminal status.
    async fn exec_pod(&self, namespace: &str, pod: &str, argv: &[String]) -> Result<ExecOutput>;

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
    ) -> Result<LogStream>;

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodUsage>;
}

/// Production gateway backed by `kube::Client`.
pub struct KubeGateway {
    kubeconfig_path: Option<PathBuf>,
    client: OnceCell<Client>,
}

impl KubeGateway {
    /// Create a gateway. The client is not connected until first use.
    pub fn new(kubeconfig_path: Option<PathBuf>) -> Self {
        Self {
            kubeconfig_path,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| Self::connect(self.kubeconfig_path.clone()))
            .await
    }

    /// Probe the credential sources in order: explicit path, the k3s
    /// well-known path, in-cluster service account. The first that loads
    /// wins; exhausting all three is fatal.
    async fn connect(explicit: Option<PathBuf>) -> Result<Client> {
        if let Some(path) = &explicit {
            match Self::client_from_kubeconfig(path).await {
                Ok(client) => return Ok(client),
                Err(err) => debug!(path = %path.display(), %err, "explicit kubeconfig unusable"),
            }
        }

        let k3s = Path::new(K3S_KUBECONFIG);
        if k3s.exists() {
            match Self::client_from_kubeconfig(k3s).await {
                Ok(client) => return Ok(client),
                Err(err) => debug!(%err, "k3s kubeconfig unusable"),
            }
        }

        match Config::incluster() {
            Ok(config) => {
                Client::try_from(config).map_err(|err| Error::Transport(err.to_string()))
            }
            Err(err) => {
                debug!(%err, "in-cluster config unavailable");
                Err(Error::Transport(
                    "Could not load Kubernetes config".to_string(),
                ))
            }
        }
    }

    async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
        let kubeconfig =
            Kubeconfig::read_from(path).map_err(|err| Error::Transport(err.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        Client::try_from(config).map_err(|err| Error::Transport(err.to_string()))
    }

    async fn workloads(&self, namespace: &str) -> Result<Api<Deployment>> {
        Ok(Api::namespaced(self.client().await?.clone(), namespace))
    }

    async fn pods(&self, namespace: &str) -> Result<Api<Pod>> {
        Ok(Api::namespaced(self.client().await?.clone(), namespace))
    }
}

/// Map a terminal exec `Status` to a process exit code. A missing status
/// counts as success; a failure status carries the code in its causes.
fn exit_code_from_status(status: Option<Status>) -> i32 {
    let Some(status) = status else {
        return 0;
    };
    match status.status.as_deref() {
        Some("Success") | None => 0,
        _ => status
            .details
            .and_then(|details| details.causes)
            .unwrap_or_default()
            .into_iter()
            .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
            .and_then(|cause| cause.message)
            .and_then(|message| message.parse().ok())
            .unwrap_or(1),
    }
}

#[async_trait]
impl Gateway for KubeGateway {
    async fn create_workload(&self, namespace: &str, workload: &Deployment) -> Result<()> {
        debug!(namespace, name = ?workload.metadata.name, "creating workload");
        self.workloads(namespace)
            .await?
            .create(&PostParams::default(), workload)
            .await?;
        Ok(())
    }

    async fn read_workload(&self, namespace: &str, name: &str) -> Result<Deployment> {
        Ok(self.workloads(namespace).await?.get(name).await?)
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, name, "deleting workload");
        self.workloads(namespace)
            .await?
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_workloads(&self, namespace: Option<&str>) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = match namespace {
            Some(ns) => Api::namespaced(self.client().await?.clone(), ns),
            None => Api::all(self.client().await?.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        debug!(namespace, name = ?secret.metadata.name, "creating secret");
        let api: Api<Secret> = Api::namespaced(self.client().await?.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, name, "deleting secret");
        let api: Api<Secret> = Api::namespaced(self.client().await?.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()> {
        debug!(namespace, name = ?policy.metadata.name, "creating network policy");
        let api: Api<NetworkPolicy> = Api::namespaced(self.client().await?.clone(), namespace);
        api.create(&PostParams::default(), policy).await?;
        Ok(())
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, name, "deleting network policy");
        let api: Api<NetworkPolicy> = Api::namespaced(self.client().await?.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).await?.list(&params).await?.items)
    }

    async fn exec_pod(&self, namespace: &str, pod: &str, argv: &[String]) -> Result<ExecOutput> {
        debug!(namespace, pod, ?argv, "exec in pod");
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        let mut attached = self
            .pods(namespace)
            .await?
            .exec(pod, argv.to_vec(), &params)
            .await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| Error::Cluster("exec stream is missing stdout".to_string()))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| Error::Cluster("exec stream is missing stderr".to_string()))?;
        let status = attached
            .take_status()
            .ok_or_else(|| Error::Cluster("exec stream is missing status".to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (stdout_read, stderr_read, status) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr),
            status,
        );
        stdout_read.map_err(|err| Error::Transport(err.to_string()))?;
        stderr_read.map_err(|err| Error::Transport(err.to_string()))?;

        Ok(ExecOutput {
            exit_code: exit_code_from_status(status),
            stdout,
            stderr,
        })
    }

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
    ) -> Result<LogStream> {
        let params = LogParams {
            container: options.container.clone(),
            follow: options.follow,
            tail_lines: options.tail_lines,
            since_seconds: options.since.map(|d| d.as_secs() as i64),
            ..Default::default()
        };
        let stream = self.pods(namespace).await?.log_stream(pod, &params).await?;
        Ok(Box::pin(tokio::io::BufReader::new(stream.compat())))
    }

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodUsage> {
        let api: Api<PodMetrics> = Api::namespaced(self.client().await?.clone(), namespace);
        let metrics = api.get(pod).await?;
        let container = metrics
            .containers
            .first()
            .ok_or_else(|| Error::Cluster(format!("no usage samples for pod {}", pod)))?;
        Ok(PodUsage {
            cpu: container.usage.cpu.0.clone(),
            memory: container.usage.memory.0.clone(),
        })
    }
}

/// Per-container usage sample from the metrics API.
#[derive(Clone, Debug, Deserialize)]
pub struct PodMetricsContainerUsage {
    pub cpu: Quantity,
    pub memory: Quantity,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PodMetricsContainer {
    pub name: String,
    pub usage: PodMetricsContainerUsage,
}

/// The `metrics.k8s.io/v1beta1` pod metrics object, declared by hand since
/// `k8s-openapi` does not ship the metrics API group.
#[derive(Clone, Debug, Deserialize)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub window: String,
    pub containers: Vec<PodMetricsContainer>,
}

impl k8s_openapi::Resource for PodMetrics {
    const GROUP: &'static str = "metrics.k8s.io";
    const KIND: &'static str = "PodMetrics";
    const VERSION: &'static str = "v1beta1";
    const API_VERSION: &'static str = "metrics.k8s.io/v1beta1";
    const URL_PATH_SEGMENT: &'static str = "pods";

    type Scope = NamespaceResourceScope;
}

impl k8s_openapi::Metadata for PodMetrics {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}
