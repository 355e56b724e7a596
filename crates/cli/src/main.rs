use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mirra_controller::{reconciler_fn, Action, Controller, MetricsLayer, ReconcilerBuilder, TimeoutLayer, TracingLayer};
use mirra_core::{Config, ObjectKey, Resource};
use mirra_informer::cluster::{self, KubeObject, KubeSource, LABEL_INDEX};
use mirra_informer::Informer;
use mirra_store::index::{by_namespace, NAMESPACE_INDEX};
use mirra_store::HandlerFns;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirra CLI: cached list, watch and reconcile")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Sync a GVK into the cache and list it
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Only objects carrying this label, as key=value
        #[arg(long = "label")]
        label: Option<String>,
    },
    /// Watch objects for a GVK and print +/~/- events
    Watch {
        gvk: String,
    },
    /// Reconcile every object of a GVK on change
    Run {
        gvk: String,
        /// Requeue each object this many seconds after a pass (0 = never)
        #[arg(long = "requeue-secs", default_value_t = 0)]
        requeue_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

type KubeInformer = Informer<KubeObject, KubeSource>;

async fn informer_for(gvk: &str, ns: Option<&str>, config: &Config) -> Result<Arc<KubeInformer>> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let source = KubeSource::for_gvk(client, gvk, ns).await?;
    let informer = Informer::new(source, config.clone());
    informer.register_index(NAMESPACE_INDEX, by_namespace())?;
    informer.register_index(LABEL_INDEX, cluster::labels_index())?;
    Ok(Arc::new(informer))
}

fn spawn_informer(informer: &Arc<KubeInformer>, stop: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let (informer, stop) = (Arc::clone(informer), stop.clone());
    tokio::spawn(async move {
        if let Err(e) = informer.run(stop).await {
            error!(error = %e, "informer failed");
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = Config::from_env();
    config.validate()?;
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = kube::Client::try_default().await.context("building kube client")?;
            let resources = cluster::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, label } => {
            info!(gvk = %gvk, ns = ?ns, label = ?label, "ls invoked");
            let informer = informer_for(&gvk, ns, &config).await?;
            let stop = CancellationToken::new();
            let task = spawn_informer(&informer, &stop);
            if !informer.wait_for_sync(config.wait_for_sync).await {
                warn!(waited_secs = config.wait_for_sync.as_secs(), "cache not synced yet; listing what arrived");
            }
            let store = informer.store();
            let mut items = match (&label, ns) {
                (Some(l), _) => store.by_index(LABEL_INDEX, l)?,
                (None, Some(n)) => store.by_index(NAMESPACE_INDEX, n)?,
                (None, None) => store.list(),
            };
            if let (Some(_), Some(n)) = (&label, ns) {
                items.retain(|o| o.metadata.namespace.as_deref() == Some(n));
            }
            items.sort_by_key(|o| o.key());

            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} {:<10} AGE", "NAMESPACE", "NAME", "VERSION");
                    for o in &items {
                        let ns_col = o.metadata.namespace.clone().unwrap_or_else(|| "-".to_string());
                        let age = o.metadata.creation_timestamp.as_ref().map(|t| render_age(t.0)).unwrap_or_else(|| "-".to_string());
                        let rv = o.resource_version().map(|v| v.to_string()).unwrap_or_default();
                        println!("{:<20} {:<40} {:<10} {}", ns_col, o.key().name, rv, age);
                    }
                }
                Output::Json => {
                    let raw: Vec<_> = items.iter().map(|o| &o.0).collect();
                    println!("{}", serde_json::to_string_pretty(&raw)?);
                }
            }
            stop.cancel();
            let _ = task.await;
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let informer = informer_for(&gvk, ns, &config).await?;
            let output = cli.output;
            informer.subscribe(Arc::new(
                HandlerFns::new()
                    .on_add(move |o: &Arc<KubeObject>| print_event(output, "+", &o.key()))
                    .on_update(move |_old: &Arc<KubeObject>, new: &Arc<KubeObject>| print_event(output, "~", &new.key()))
                    .on_delete(move |o: &Arc<KubeObject>| print_event(output, "-", &o.key())),
            ));
            let stop = CancellationToken::new();
            let task = spawn_informer(&informer, &stop);
            let _ = signal::ctrl_c().await;
            info!("Ctrl-C received; shutting down watch");
            stop.cancel();
            let _ = task.await;
        }
        Commands::Run { gvk, requeue_secs } => {
            info!(gvk = %gvk, ns = ?ns, requeue_secs, "run invoked");
            let informer = informer_for(&gvk, ns, &config).await?;
            let store = informer.store();
            let requeue = (requeue_secs > 0).then(|| Duration::from_secs(requeue_secs));
            let reconciler = reconciler_fn(move |key: ObjectKey| {
                let store = Arc::clone(&store);
                async move {
                    match store.get(&key) {
                        Some(o) => {
                            let rv = o.resource_version().map(|v| v.to_string()).unwrap_or_default();
                            info!(key = %key, rv = %rv, "observed");
                        }
                        None => info!(key = %key, "gone"),
                    }
                    Ok(requeue.map(Action::RequeueAfter).unwrap_or(Action::Done))
                }
            });
            let reconciler = ReconcilerBuilder::new(reconciler)
                .layer(MetricsLayer)
                .layer(TimeoutLayer::new(Duration::from_secs(30)))
                .layer(TracingLayer)
                .build();
            let controller = Arc::new(Controller::new(reconciler, &config));
            informer.subscribe(controller.enqueue_handler());

            let stop = CancellationToken::new();
            let informer_task = spawn_informer(&informer, &stop);
            let controller_task = {
                let (controller, stop) = (Arc::clone(&controller), stop.clone());
                tokio::spawn(async move { controller.run(stop).await })
            };
            let _ = signal::ctrl_c().await;
            info!("Ctrl-C received; shutting down");
            stop.cancel();
            let _ = controller_task.await;
            let _ = informer_task.await;
        }
    }

    Ok(())
}

fn print_event(output: Output, sign: &str, key: &ObjectKey) {
    match output {
        Output::Human => println!("{} {}", sign, key),
        Output::Json => {
            let kind = match sign {
                "+" => "add",
                "~" => "update",
                _ => "delete",
            };
            println!("{}", serde_json::json!({ "event": kind, "key": key.to_string() }));
        }
    }
}

fn render_age(created: chrono::DateTime<chrono::Utc>) -> String {
    let mut secs = chrono::Utc::now().signed_duration_since(created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
