use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_appfile::{parse, RenderContext, Renderer};
use keel_controller::{ControllerConfig, Definitions, Manager, Reconciler};
use keel_core::KindRegistry;
use keel_kubehub::{KubeCluster, ObjectKey};
use keel_rollout::{source_remaining, RolloutPlan};
use keel_template::{TemplateKind, TemplateSet};
use serde_json::Value as Json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel application renderer and rollout controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: "default" for offline rendering, all for `run`)
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render an appfile offline and print the manifests
    Render {
        /// Appfile (YAML or JSON)
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Definition documents (multi-document YAML)
        #[arg(short = 'd', long = "definitions")]
        definitions: String,
        /// Revision name to render under (default: <app>-v1)
        #[arg(long = "revision")]
        revision: Option<String>,
        /// Suffix workload names with the revision, as rollout mode does
        #[arg(long = "rollout", action = ArgAction::SetTrue)]
        rollout: bool,
    },
    /// List the templates in a definitions file with their parameters
    Definitions {
        #[arg(short = 'd', long = "definitions")]
        definitions: String,
    },
    /// Show how a rollout plan splits into batches
    Plan {
        /// Replicas the target should end with
        #[arg(long = "target-size")]
        target_size: i32,
        /// Number of evenly sized batches
        #[arg(long = "batches", default_value_t = 1)]
        batches: i32,
        /// Replicas the source starts with
        #[arg(long = "source-size", default_value_t = 0)]
        source_size: i32,
        /// Stop after this batch
        #[arg(long = "partition")]
        partition: Option<i32>,
    },
    /// Watch Applications and AppRollouts and reconcile them until Ctrl-C
    Run {
        /// Read definitions from a file instead of the cluster
        #[arg(short = 'd', long = "definitions", env = "KEEL_DEFINITIONS")]
        definitions: Option<String>,
    },
    /// Run one reconcile pass for an Application
    Reconcile {
        /// namespace/name
        key: String,
        #[arg(short = 'd', long = "definitions", env = "KEEL_DEFINITIONS")]
        definitions: Option<String>,
        /// Treat the key as an AppRollout
        #[arg(long = "rollout", action = ArgAction::SetTrue)]
        rollout: bool,
    },
    /// Print the status of an AppRollout
    Status {
        /// namespace/name
        key: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_key(key: &str, default_ns: Option<&str>) -> Result<ObjectKey> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(ObjectKey::new(ns, name)),
        None if !key.is_empty() => Ok(ObjectKey::new(default_ns.unwrap_or("default"), key)),
        _ => bail!("expected namespace/name, got {:?}", key),
    }
}

fn read_doc(path: &str) -> Result<Json> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path))?;
    // YAML is a superset of JSON
    serde_yaml::from_str(&text).with_context(|| format!("parse {}", path))
}

fn load_templates(path: &str) -> Result<TemplateSet> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path))?;
    Ok(TemplateSet::from_yaml(&text)?)
}

fn definitions_from(path: Option<&str>, config: &ControllerConfig) -> Result<Definitions> {
    Ok(match path {
        Some(p) => Definitions::Static(Arc::new(load_templates(p)?)),
        None => Definitions::Cluster { shared_namespace: config.definition_namespace.clone() },
    })
}

async fn reconciler(definitions: Option<&str>) -> Result<(Arc<KubeCluster>, Arc<Reconciler>)> {
    let config = ControllerConfig::from_env();
    let cluster = Arc::new(KubeCluster::connect().await?);
    let defs = definitions_from(definitions, &config)?;
    let rec = Reconciler::new(cluster.clone(), KindRegistry::builtin(), defs, config);
    Ok((cluster, Arc::new(rec)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Render { file, definitions, revision, rollout } => {
            let templates = load_templates(&definitions)?;
            let raw = read_doc(&file)?;
            let af = parse(&raw, &templates)?;
            let ns = cli.namespace.as_deref().unwrap_or("default");
            let revision = revision.unwrap_or_else(|| format!("{}-v1", af.name));
            info!(app = %af.name, ns, revision = %revision, rollout, "render invoked");
            let ctx = RenderContext::new(&af.name, ns, revision).with_rollout(rollout);
            let manifests = Renderer::new(KindRegistry::builtin()).render_appfile(&af, &ctx)?;
            match cli.output {
                Output::Human => {
                    for m in &manifests {
                        println!("---");
                        print!("{}", serde_yaml::to_string(&m.body)?);
                    }
                }
                Output::Json => {
                    let bodies: Vec<&Json> = manifests.iter().map(|m| &m.body).collect();
                    println!("{}", serde_json::to_string_pretty(&bodies)?);
                }
            }
        }
        Commands::Definitions { definitions } => {
            let templates = load_templates(&definitions)?;
            match cli.output {
                Output::Human => {
                    for t in templates.iter() {
                        let kind = match t.kind { TemplateKind::Workload => "workload", TemplateKind::Trait => "trait" };
                        println!("{} • {}", t.name, kind);
                        for p in t.parameter_info() {
                            let req = if p.required { " (required)" } else { "" };
                            println!("    {}: {}{}", p.name, p.type_name, req);
                        }
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> { name: &'a str, kind: TemplateKind, parameters: Vec<keel_template::ParameterInfo> }
                    let rows: Vec<_> =
                        templates.iter().map(|t| Row { name: &t.name, kind: t.kind, parameters: t.parameter_info() }).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Plan { target_size, batches, source_size, partition } => {
            let plan = RolloutPlan {
                target_size: Some(target_size),
                num_batches: Some(batches),
                batch_partition: partition,
                ..RolloutPlan::default()
            }
            .finalized(source_size);
            plan.validate().map_err(|e| anyhow!("invalid plan: {}", e))?;
            let n = plan.batches.len();
            let rows: Vec<(usize, i32, i32, i32)> = (0..n)
                .map(|i| {
                    let cumulative = plan.cumulative(i);
                    let source = source_remaining(source_size, cumulative, target_size, i + 1 == n);
                    (i, plan.batches[i].replicas, cumulative, source)
                })
                .collect();
            match cli.output {
                Output::Human => {
                    println!("BATCH  SIZE  TARGET  SOURCE");
                    for (i, size, cumulative, source) in &rows {
                        let halt = if partition.map_or(false, |p| *i as i32 == p) { "  <- partition" } else { "" };
                        println!("{:<6} {:<5} {:<7} {}{}", i, size, cumulative, source, halt);
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row { batch: usize, replicas: i32, target: i32, source: i32 }
                    let rows: Vec<_> =
                        rows.into_iter().map(|(batch, replicas, target, source)| Row { batch, replicas, target, source }).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Run { definitions } => {
            let (cluster, rec) = reconciler(definitions.as_deref()).await?;
            let config = rec.config().clone();
            info!(ns = ?cli.namespace, workers = config.workers, "controller starting");
            let manager = Arc::new(Manager::new(rec, config));
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                match signal::ctrl_c().await {
                    Ok(()) => info!("Ctrl-C received; shutting down"),
                    Err(e) => error!(error = %e, "signal handler failed; shutting down"),
                }
                stop.cancel();
            });
            manager.run(cluster, cli.namespace.clone(), cancel).await?;
            warn!("controller stopped");
        }
        Commands::Reconcile { key, definitions, rollout } => {
            let key = parse_key(&key, cli.namespace.as_deref())?;
            let (_cluster, rec) = reconciler(definitions.as_deref()).await?;
            let cancel = CancellationToken::new();
            let res = if rollout { rec.reconcile_rollout(&key, &cancel).await } else { rec.reconcile(&key, &cancel).await };
            match res {
                Ok(requeue) => match cli.output {
                    Output::Human => println!("{} reconciled: {:?}", key, requeue),
                    Output::Json => println!("{}", serde_json::json!({ "key": key.to_string(), "requeue": format!("{:?}", requeue) })),
                },
                Err(e) => {
                    error!(key = %key, class = e.class().as_str(), error = %e, "reconcile failed");
                    bail!("reconcile {}: {}", key, e);
                }
            }
        }
        Commands::Status { key } => {
            let key = parse_key(&key, cli.namespace.as_deref())?;
            let (_cluster, rec) = reconciler(None).await?;
            match rec.rollout_status(&key).await? {
                Some(status) => match cli.output {
                    Output::Human => {
                        println!("state:   {:?} ({:?})", status.rolling_state, status.batch_rolling_state);
                        println!("batch:   {}", status.current_batch);
                        println!("target:  {}/{} ready of {}", status.upgraded_ready_replicas, status.upgraded_replicas, status.rollout_target_size);
                        println!("source:  {} ({} replicas at start)", status.last_source_revision, status.rollout_original_size);
                        for c in &status.conditions {
                            println!("{:<8} {:?} {} {}", c.type_, c.status, c.reason, c.message);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                },
                None => eprintln!("rollout {} not found", key),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        assert_eq!(parse_key("prod/shop", None).unwrap(), ObjectKey::new("prod", "shop"));
        assert_eq!(parse_key("shop", Some("dev")).unwrap(), ObjectKey::new("dev", "shop"));
        assert_eq!(parse_key("shop", None).unwrap(), ObjectKey::new("default", "shop"));
        assert!(parse_key("/shop", None).is_err());
        assert!(parse_key("", None).is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from(["keelctl", "-o", "json", "plan", "--target-size", "5", "--batches", "3"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Plan { target_size: 5, batches: 3, partition: None, .. }));
    }
}
