use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use katakate::aggregator;
use katakate::api_keys::ApiKeyStore;
use katakate::exec;
use katakate::gateway::{Gateway, KubeGateway, LogOptions};
use katakate::http_api::{AppState, run_server};
use katakate::lifecycle::SandboxController;
use katakate::progress::{ProgressEvent, Stage, Status};
use katakate::spec::SandboxSpec;

#[derive(Parser)]
#[command(name = "k7")]
#[command(about = "Short-lived VM-isolated sandboxes on Kubernetes")]
#[command(version)]
struct Cli {
    /// Path to a kubeconfig file (default: k3s path, then in-cluster)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox from a k7.yaml file and/or CLI flags
    Create {
        /// Sandbox name (overrides the config file)
        name: Option<String>,
        /// Container image (overrides the config file)
        image: Option<String>,
        /// Path to a k7.yaml spec file
        #[arg(short = 'f', long = "file")]
        config: Option<PathBuf>,
        /// Kubernetes namespace
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// CPU limit (e.g. '1', '500m')
        #[arg(long)]
        cpu: Option<String>,
        /// Memory limit (e.g. '1Gi', '512Mi')
        #[arg(long)]
        memory: Option<String>,
        /// Ephemeral storage limit (e.g. '2Gi')
        #[arg(long)]
        storage: Option<String>,
        /// Path to an environment file turned into a secret
        #[arg(long)]
        env_file: Option<String>,
        /// CIDR blocks for the egress whitelist (repeatable)
        #[arg(long = "egress")]
        egress_whitelist: Option<Vec<String>>,
        /// Script to run before the main container process
        #[arg(long)]
        before_script: Option<String>,
        /// Run the pod with non-root defaults (uid/gid/fsGroup 65532)
        #[arg(long)]
        pod_non_root: bool,
        /// Run the main container as non-root (uid 65532)
        #[arg(long)]
        container_non_root: bool,
        /// Linux capabilities to add back (repeatable)
        #[arg(long = "cap-add")]
        cap_add: Option<Vec<String>>,
        /// Linux capabilities to drop (repeatable)
        #[arg(long = "cap-drop")]
        cap_drop: Option<Vec<String>>,
    },
    /// List sandboxes (all namespaces unless -n is given)
    List {
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Delete a sandbox and all its associated resources
    Delete {
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// Delete all sandboxes in a namespace
    DeleteAll {
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Execute a command in a sandbox
    Exec {
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Command to execute (run under /bin/sh -c)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Show sandbox pod logs
    Logs {
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Follow logs output
        #[arg(short, long)]
        follow: bool,
        /// Number of lines to show from the end of the logs
        #[arg(long, default_value_t = 200)]
        tail: i64,
    },
    /// Show sandbox resource usage (CPU, memory)
    Top {
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Generate a new API key
    GenerateApiKey {
        name: String,
        /// API key expiration in days
        #[arg(long, default_value_t = 365)]
        expires_days: i64,
    },
    /// List all API keys
    ListApiKeys,
    /// Revoke an API key by name
    RevokeApiKey { name: String },
    /// Start the HTTP API server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let gateway = Arc::new(KubeGateway::new(cli.kubeconfig.clone()));
    let controller = SandboxController::new(gateway.clone());

    match cli.command {
        Commands::Create {
            name,
            image,
            config,
            namespace,
            cpu,
            memory,
            storage,
            env_file,
            egress_whitelist,
            before_script,
            pod_non_root,
            container_non_root,
            cap_add,
            cap_drop,
        } => {
            let spec = build_create_spec(CreateArgs {
                name,
                image,
                config,
                namespace,
                cpu,
                memory,
                storage,
                env_file,
                egress_whitelist,
                before_script,
                pod_non_root,
                container_non_root,
                cap_add,
                cap_drop,
            })?;

            println!(
                "Creating sandbox '{}' with image '{}'...",
                spec.name, spec.image
            );
            let sink = |event: &ProgressEvent| render_progress(event);
            let result = controller.create_sandbox(&spec, Some(&sink)).await;
            if !result.success {
                bail!("Failed to create sandbox: {}", result.error);
            }
            println!("\n{}", result.message);
            println!("\nNext steps:");
            println!("  k7 exec {} -- uname -a", spec.name);
            println!("  k7 logs {}", spec.name);
        }
        Commands::List { namespace } => {
            let sandboxes = aggregator::list_sandboxes(gateway.as_ref(), namespace.as_deref()).await;
            if sandboxes.is_empty() {
                match namespace {
                    Some(ns) => println!("No sandboxes found in namespace '{}'.", ns),
                    None => println!("No sandboxes found."),
                }
                return Ok(());
            }
            println!(
                "{:<24} {:<12} {:<10} {:<6} {:<9} {:<20} {}",
                "NAME", "NAMESPACE", "STATUS", "READY", "RESTARTS", "AGE", "IMAGE"
            );
            for s in sandboxes {
                println!(
                    "{:<24} {:<12} {:<10} {:<6} {:<9} {:<20} {}",
                    s.name, s.namespace, s.status, s.ready, s.restarts, s.age, s.image
                );
            }
        }
        Commands::Delete { name, namespace } => {
            let result = controller.delete_sandbox(&name, &namespace).await;
            if !result.success {
                bail!("Failed to delete sandbox: {}", result.error);
            }
            println!("{}", result.message);
        }
        Commands::DeleteAll { namespace, yes } => {
            let sandboxes =
                aggregator::list_sandboxes(gateway.as_ref(), Some(&namespace)).await;
            if sandboxes.is_empty() {
                println!("No sandboxes found in namespace {}", namespace);
                return Ok(());
            }
            println!(
                "Found {} sandbox(es) in namespace {}:",
                sandboxes.len(),
                namespace
            );
            for sandbox in &sandboxes {
                println!("  - {}", sandbox.name);
            }
            if !yes && !confirm("Are you sure you want to delete all these sandboxes?")? {
                println!("Deletion cancelled");
                return Ok(());
            }

            let result = controller.delete_all_sandboxes(&namespace).await;
            if !result.success {
                eprintln!("Failed to delete all sandboxes: {}", result.error);
                if let Some(reports) = result.data.as_ref().and_then(|data| data.as_array()) {
                    for report in reports {
                        if report["success"] == false {
                            eprintln!("  - {}: {}", report["name"], report["error"]);
                        }
                    }
                }
                std::process::exit(1);
            }
            println!("{}", result.message);
        }
        Commands::Exec {
            name,
            namespace,
            command,
        } => {
            let command = command.join(" ");
            let result = exec::exec_command(gateway.as_ref(), &name, &command, &namespace).await;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
        }
        Commands::Logs {
            name,
            namespace,
            follow,
            tail,
        } => {
            let pods = gateway
                .list_pods(&namespace, &format!("app={}", name))
                .await
                .map_err(|err| anyhow::anyhow!("Failed to resolve pod for sandbox '{}': {}", name, err))?;
            let Some(pod_name) = pods.first().and_then(|pod| pod.metadata.name.clone()) else {
                bail!(
                    "No pod found for sandbox '{}' in namespace '{}'.",
                    name,
                    namespace
                );
            };

            let options = LogOptions {
                follow,
                tail_lines: Some(tail),
                ..Default::default()
            };
            let stream = gateway
                .stream_pod_logs(&namespace, &pod_name, &options)
                .await
                .map_err(|err| anyhow::anyhow!("Failed to stream logs: {}", err))?;
            let mut lines = stream.lines();
            while let Some(line) = lines.next_line().await? {
                println!("{}", line);
            }
        }
        Commands::Top { namespace } => {
            let metrics = aggregator::get_metrics(gateway.as_ref(), namespace.as_deref()).await;
            if metrics.is_empty() {
                println!("No running sandboxes with metrics available.");
                return Ok(());
            }
            println!(
                "{:<24} {:<12} {:>12} {:>14}",
                "NAME", "NAMESPACE", "CPU (cores)", "MEMORY (MiB)"
            );
            for m in metrics {
                let cpu = aggregator::cpu_cores(&m.cpu_usage)
                    .map(|cores| format!("{:.3}", cores))
                    .unwrap_or_else(|| "N/A".to_string());
                let memory = aggregator::memory_mib(&m.memory_usage)
                    .map(|mib| format!("{:.2}", mib))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("{:<24} {:<12} {:>12} {:>14}", m.name, m.namespace, cpu, memory);
            }
        }
        Commands::GenerateApiKey { name, expires_days } => {
            let store = ApiKeyStore::from_env();
            let token = store.generate(&name, expires_days)?;
            let expires = chrono::Utc::now().timestamp() + expires_days * 86_400;
            println!("Generated API key for '{}':", name);
            println!("API Key: {}", token);
            println!("Expires: {}", format_timestamp(expires));
            println!("Keep this key secure - it won't be shown again!");
        }
        Commands::ListApiKeys => {
            let store = ApiKeyStore::from_env();
            let keys = store.list()?;
            if keys.is_empty() {
                println!("No API keys found.");
                return Ok(());
            }
            println!(
                "{:<20} {:<18} {:<18} {:<18}",
                "NAME", "CREATED", "EXPIRES", "LAST USED"
            );
            for record in keys.values() {
                let last_used = record
                    .last_used
                    .map(format_timestamp)
                    .unwrap_or_else(|| "Never".to_string());
                println!(
                    "{:<20} {:<18} {:<18} {:<18}",
                    record.name,
                    format_timestamp(record.created),
                    format_timestamp(record.expires),
                    last_used
                );
            }
        }
        Commands::RevokeApiKey { name } => {
            let store = ApiKeyStore::from_env();
            if store.revoke(&name)? {
                println!("API key '{}' revoked successfully.", name);
            } else {
                println!("API key '{}' not found.", name);
            }
        }
        Commands::Serve { host, port } => {
            let addr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("Invalid bind address {}:{}", host, port))?;
            let state = AppState {
                controller,
                keys: ApiKeyStore::from_env(),
            };
            run_server(addr, state).await?;
        }
    }

    Ok(())
}

struct CreateArgs {
    name: Option<String>,
    image: Option<String>,
    config: Option<PathBuf>,
    namespace: String,
    cpu: Option<String>,
    memory: Option<String>,
    storage: Option<String>,
    env_file: Option<String>,
    egress_whitelist: Option<Vec<String>>,
    before_script: Option<String>,
    pod_non_root: bool,
    container_non_root: bool,
    cap_add: Option<Vec<String>>,
    cap_drop: Option<Vec<String>>,
}

/// Merge a k7.yaml file (auto-detected when not given) with CLI overrides.
fn build_create_spec(args: CreateArgs) -> Result<SandboxSpec> {
    let config = args.config.or_else(|| {
        ["k7.yaml", "k7.yml"]
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists())
    });

    let mut spec = match config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file {} does not exist", path.display());
            }
            let mut spec = SandboxSpec::from_yaml_file(&path)?;
            if let Some(name) = args.name {
                spec.name = name;
            }
            if let Some(image) = args.image {
                spec.image = image;
            }
            if args.namespace != "default" {
                spec.namespace = args.namespace;
            }
            if args.env_file.is_some() {
                spec.env_file = args.env_file;
            }
            if args.egress_whitelist.is_some() {
                spec.egress_whitelist = args.egress_whitelist;
            }
            if let Some(script) = args.before_script {
                spec.before_script = script;
            }
            if args.pod_non_root {
                spec.pod_non_root = true;
            }
            if args.container_non_root {
                spec.container_non_root = true;
            }
            if args.cap_add.is_some() {
                spec.cap_add = args.cap_add;
            }
            if args.cap_drop.is_some() {
                spec.cap_drop = args.cap_drop;
            }
            spec
        }
        None => {
            let (Some(name), Some(image)) = (args.name, args.image) else {
                bail!("Name and image must be provided via CLI or k7.yaml");
            };
            SandboxSpec {
                name,
                image,
                namespace: args.namespace,
                env_file: args.env_file,
                egress_whitelist: args.egress_whitelist,
                limits: Default::default(),
                before_script: args.before_script.unwrap_or_default(),
                pod_non_root: args.pod_non_root,
                container_non_root: args.container_non_root,
                cap_drop: args.cap_drop,
                cap_add: args.cap_add,
                runtime_class_name: None,
            }
        }
    };

    if let Some(cpu) = args.cpu {
        spec.limits.insert("cpu".to_string(), cpu);
    }
    if let Some(memory) = args.memory {
        spec.limits.insert("memory".to_string(), memory);
    }
    if let Some(storage) = args.storage {
        spec.limits.insert("ephemeral-storage".to_string(), storage);
    }

    Ok(spec)
}

/// Render one progress event as a terminal line.
fn render_progress(event: &ProgressEvent) {
    let line = match (event.stage, event.status) {
        (Stage::Provisioning, Some(Status::Start)) => "Provisioning deployment...".to_string(),
        (Stage::Provisioning, Some(Status::Done)) => "Deployment provisioned".to_string(),
        (Stage::BeforeScript, Some(Status::Waiting)) => {
            "Waiting for before-script to complete...".to_string()
        }
        (Stage::BeforeScript, Some(Status::Done)) => "Before-script finished".to_string(),
        (Stage::BeforeScript, Some(Status::Skipped)) => return,
        (Stage::NetworkLockdown, Some(Status::Applying)) => {
            "Applying egress lockdown...".to_string()
        }
        (Stage::NetworkLockdown, Some(Status::Done)) => "Egress locked down".to_string(),
        (Stage::NetworkLockdown, Some(Status::Skipped)) => "Egress left open".to_string(),
        (Stage::NetworkLockdown, Some(Status::Exists)) => {
            "Ingress deny policy already present".to_string()
        }
        (Stage::Complete, Some(Status::Success)) => return,
        (Stage::Error, _) | (_, Some(Status::Error)) => {
            format!("Error: {}", event.error.as_deref().unwrap_or("unknown"))
        }
        _ => return,
    };
    println!("  {}", line);
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Invalid".to_string())
}
