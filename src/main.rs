use anyhow::{Context, bail};
use appmeta::appmeta::DevType;
use appmeta::config::WatcherSettings;
use appmeta::manager::{AppMetaManager, KubeConnector};
use appmeta::{ApplicationMeta, Credential};
use clap::{Parser, Subcommand};
use k8s_openapi::serde_json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a kubeconfig; defaults to $KUBECONFIG, then ~/.kube/config
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Namespace the applications live in
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log dev-mode transitions until interrupted
    Watch,
    /// Print every application in the namespace
    List,
    /// Print one application
    Get { application: String },
    /// Put a workload of an application into dev mode
    DevStart {
        application: String,
        resource: String,
        #[arg(long, default_value = "")]
        dev_type: String,
        /// Dev session identifier; a fresh one is generated if omitted
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Take a workload of an application out of dev mode
    DevEnd {
        application: String,
        resource: String,
        #[arg(long, default_value = "")]
        dev_type: String,
    },
}

fn kubeconfig_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .or_else(|| {
            std::env::var_os("KUBECONFIG")
                .and_then(|paths| std::env::split_paths(&paths).next())
        })
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube/config")))
}

fn load_credential(explicit: Option<PathBuf>) -> anyhow::Result<Credential> {
    let explicit_given = explicit.is_some();
    match kubeconfig_path(explicit) {
        Some(path) if explicit_given => {
            let raw = std::fs::read(&path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Ok(Credential::from(raw))
        }
        Some(path) => Ok(std::fs::read(&path).map_or_else(
            |e| {
                debug!("No kubeconfig at {} ({}), inferring", path.display(), e);
                Credential::empty()
            },
            Credential::from,
        )),
        None => Ok(Credential::empty()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn installed(
    manager: &AppMetaManager,
    namespace: &str,
    application: &str,
    credential: &Credential,
) -> anyhow::Result<ApplicationMeta> {
    let meta = manager
        .get_application_meta(namespace, application, credential)
        .await;
    if !meta.is_installed() {
        bail!(meta.not_install_tips());
    }
    Ok(meta)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let namespace = args.namespace;
    let credential = load_credential(args.kubeconfig)?;
    let manager = AppMetaManager::new(Arc::new(KubeConnector::default()), WatcherSettings::from_env());

    match args.command {
        Command::Watch => {
            manager.start();
            let watcher = manager.watcher(&namespace, &credential).await?;
            info!("Watching applications in ns {}, Ctrl-C to stop", watcher.namespace());
            tokio::signal::ctrl_c().await?;
            manager.shutdown();
        }
        Command::List => {
            let summaries: Vec<_> = manager
                .get_application_metas(&namespace, &credential)
                .await
                .iter()
                .map(ApplicationMeta::summary)
                .collect();
            print_json(&summaries)?;
        }
        Command::Get { application } => {
            let meta = manager
                .get_application_meta(&namespace, &application, &credential)
                .await;
            print_json(&meta.summary())?;
        }
        Command::DevStart {
            application,
            resource,
            dev_type,
            identifier,
        } => {
            let dev_type: DevType = dev_type.parse()?;
            let identifier = identifier.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut meta = installed(&manager, &namespace, &application, &credential).await?;
            let operator = manager.watcher(&namespace, &credential).await?.operator();

            meta.dev_start(operator.as_ref(), &resource, &dev_type, &identifier)
                .await?;
            manager
                .update_application_meta_manually(
                    &namespace,
                    &credential,
                    &meta.record_name(),
                    meta.secret.clone(),
                )
                .await?;
            print_json(&meta.summary())?;
        }
        Command::DevEnd {
            application,
            resource,
            dev_type,
        } => {
            let dev_type: DevType = dev_type.parse()?;
            let mut meta = installed(&manager, &namespace, &application, &credential).await?;
            let operator = manager.watcher(&namespace, &credential).await?.operator();

            meta.dev_end(operator.as_ref(), &resource, &dev_type).await?;
            manager
                .update_application_meta_manually(
                    &namespace,
                    &credential,
                    &meta.record_name(),
                    meta.secret.clone(),
                )
                .await?;
            print_json(&meta.summary())?;
        }
    }

    Ok(())
}
