//! meshop operator - service-mesh control plane installer

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, CustomResourceExt};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshop::controller::{error_policy, reconcile, Context, ControllerConfig};
use meshop::crd::MeshControlPlane;
use meshop::graph::DependencyGraph;
use meshop::manifest::diff_manifests;
use meshop::migrate::{values_from_configmap, ConfigMapRef, Migration, DEFAULT_VALUES_KEY};
use meshop::profile::ProfileStore;
use meshop::render::{DEFAULT_CHARTS_DIR, DEFAULT_HELM_BIN};
use meshop::translate::Translator;
use meshop::yaml::{parse_yaml, to_yaml};
use meshop::DEFAULT_NAMESPACE;

/// meshop - installs and upgrades a service-mesh control plane
#[derive(Parser, Debug)]
#[command(name = "meshop", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches MeshControlPlane resources in every namespace and keeps the
    /// cluster in line with them.
    Controller(ControllerArgs),

    /// Convert a legacy values document into a MeshControlPlane
    Migrate(MigrateArgs),

    /// Print the component install tree
    InstallTree {
        /// Also print the install waves
        #[arg(long)]
        waves: bool,
    },

    /// Work with rendered manifests
    #[command(subcommand)]
    Manifest(ManifestCommands),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Directory holding the component charts
    #[arg(long, env = "MESHOP_CHARTS_DIR", default_value = DEFAULT_CHARTS_DIR)]
    charts_dir: PathBuf,

    /// helm binary used to render charts
    #[arg(long, env = "MESHOP_HELM_BIN", default_value = DEFAULT_HELM_BIN)]
    helm_bin: String,

    /// Seconds between passes over an unchanged resource
    #[arg(long, env = "MESHOP_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        let config = ControllerConfig::default();
        Self {
            charts_dir: config.charts_dir,
            helm_bin: config.helm_bin,
            resync_secs: config.resync_interval.as_secs(),
        }
    }
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            charts_dir: args.charts_dir,
            helm_bin: args.helm_bin,
            resync_interval: Duration::from_secs(args.resync_secs),
        }
    }
}

/// Migrate mode arguments
#[derive(Parser, Debug)]
struct MigrateArgs {
    /// Legacy values document
    #[arg(required_unless_present = "configmap")]
    values: Option<PathBuf>,

    /// Read the values from a ConfigMap in the cluster instead, as
    /// <namespace>/<name>
    #[arg(long, conflicts_with = "values")]
    configmap: Option<ConfigMapRef>,

    /// ConfigMap entry holding the values
    #[arg(long, default_value = DEFAULT_VALUES_KEY, requires = "configmap")]
    configmap_key: String,

    /// Profile the translation is layered on, by name or path
    #[arg(short = 'p', long)]
    profile: Option<String>,

    /// Charts directory whose profiles/ subdirectory holds the named profiles
    #[arg(long, env = "MESHOP_CHARTS_DIR", default_value = DEFAULT_CHARTS_DIR)]
    charts_dir: PathBuf,

    /// Existing MeshControlPlane (or bare spec) layered between the profile
    /// and the translation
    #[arg(long)]
    base: Option<PathBuf>,

    /// Namespace of the generated resource
    #[arg(short = 'n', long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Name of the generated resource
    #[arg(long, default_value = "control-plane")]
    name: String,
}

#[derive(Subcommand, Debug)]
enum ManifestCommands {
    /// Compare two manifest files object by object
    Diff {
        /// First manifest file
        left: PathBuf,
        /// Second manifest file
        right: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MeshControlPlane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(args).await,
        Some(Commands::InstallTree { waves }) => {
            run_install_tree(waves);
            Ok(())
        }
        Some(Commands::Manifest(ManifestCommands::Diff { left, right })) => {
            run_manifest_diff(&left, &right).await
        }
        Some(Commands::Controller(args)) => run_controller(args.into()).await,
        None => run_controller(ControllerArgs::default().into()).await,
    }
}

async fn read_yaml(path: &Path) -> anyhow::Result<Value> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))?;
    parse_yaml(&content).map_err(|e| anyhow::anyhow!("Failed to parse {:?}: {}", path, e))
}

/// Translate a values document and print the resulting MeshControlPlane
async fn run_migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let values = match (&args.values, &args.configmap) {
        (Some(path), _) => read_yaml(path).await?,
        (None, Some(configmap)) => read_configmap_values(configmap, &args.configmap_key).await?,
        (None, None) => anyhow::bail!("either a values file or --configmap is required"),
    };

    let mut migration = Migration::new();
    if let Some(name) = &args.profile {
        let profile = ProfileStore::in_charts_dir(&args.charts_dir).load(name).await?;
        migration = migration.profile(name, profile);
    }
    if let Some(path) = &args.base {
        migration = migration.base(read_yaml(path).await?);
    }

    let resource =
        migration.resource(&Translator::default(), &values, &args.name, &args.namespace)?;
    print!("{}", to_yaml(&resource)?);
    Ok(())
}

async fn read_configmap_values(configmap: &ConfigMapRef, key: &str) -> anyhow::Result<Value> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let api: Api<ConfigMap> = Api::namespaced(client, &configmap.namespace);
    let found = api
        .get(&configmap.name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read ConfigMap {}: {}", configmap, e))?;

    tracing::info!(configmap = %configmap, key, "translating in-cluster values");
    Ok(values_from_configmap(&found, key)?)
}

fn run_install_tree(waves: bool) {
    let graph = DependencyGraph::standard();
    print!("{}", graph.install_tree());

    if waves {
        println!();
        for (i, wave) in graph.install_tree().waves().iter().enumerate() {
            let names: Vec<String> = wave.iter().map(ToString::to_string).collect();
            println!("wave {i}: {}", names.join(", "));
        }
    }
}

async fn run_manifest_diff(left: &Path, right: &Path) -> anyhow::Result<()> {
    let read = |path: &Path| {
        let path = path.to_path_buf();
        async move {
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))
        }
    };
    let diff = diff_manifests(&read(left).await?, &read(right).await?)?;

    if diff.is_empty() {
        println!("manifests are identical");
    } else {
        println!("{diff}");
    }
    Ok(())
}

/// Run the MeshControlPlane controller until a shutdown signal arrives
async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!(
        charts_dir = %config.charts_dir.display(),
        helm = %config.helm_bin,
        resync_secs = config.resync_interval.as_secs(),
        "Starting meshop controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(Context::new(client.clone(), &config));
    let control_planes: Api<MeshControlPlane> = Api::all(client);

    Controller::new(control_planes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Control plane reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Control plane reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Controller shut down");
    Ok(())
}
