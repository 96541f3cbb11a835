//! Operator CLI: validate definitions, preview resolution and dry runs, and
//! inspect tenants against the configured databases.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_provisioner::{
    build_engine,
    config::Config,
    db::{
        self,
        memory::{MemoryControlStore, MemoryTenantDatabases},
    },
    models::{
        migration::{parse_definition_ref, Layer},
        snapshot::Fingerprint,
        tenant::TenantId,
    },
    services::{
        definitions::DefinitionSet,
        engine::{Engine, EngineSettings},
        events::CollectingEventSink,
        lock::InProcessLock,
    },
};

const DRY_RUN_TENANT: &str = "dry-run";
const DRIFT_CONCURRENCY: usize = 4;

#[derive(Parser)]
#[command(name = "provisionctl", about = "Tenant schema provisioning operator tool")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the definition store
    Validate {
        #[arg(long, env = "DEFINITIONS_DIR", default_value = "./definitions")]
        dir: PathBuf,
    },
    /// Print the module order a template request resolves to
    Resolve {
        #[arg(long, env = "DEFINITIONS_DIR", default_value = "./definitions")]
        dir: PathBuf,
        /// Template as `slug` or `slug@version`
        #[arg(long)]
        template: String,
        #[arg(long = "module")]
        modules: Vec<String>,
    },
    /// Dry-run a template request against an in-memory tenant
    Plan {
        #[arg(long, env = "DEFINITIONS_DIR", default_value = "./definitions")]
        dir: PathBuf,
        #[arg(long)]
        template: String,
        #[arg(long = "module")]
        modules: Vec<String>,
    },
    /// Print a tenant's audit ledger
    History {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        layer: Option<Layer>,
    },
    /// Check one tenant, or every tenant, for schema drift
    Drift {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        tenant: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Args::parse().command {
        Command::Validate { dir } => validate(dir).await,
        Command::Resolve { dir, template, modules } => resolve(dir, &template, &modules).await,
        Command::Plan { dir, template, modules } => plan(dir, &template, &modules).await,
        Command::History { tenant, layer } => history(&tenant, layer).await,
        Command::Drift { tenant, all } => drift(tenant, all).await,
    }
}

async fn validate(dir: PathBuf) -> Result<()> {
    let defs = DefinitionSet::load_dir(&dir).await?;
    println!("basic       {} unit(s), version {}", defs.basic.len(), defs.basic_version);
    for t in defs.templates.values() {
        println!(
            "template    {}@{} ({} unit(s), requires {:?})",
            t.slug,
            t.version,
            t.units.len(),
            t.required_modules
        );
    }
    for m in defs.modules.values() {
        println!("module      {}@{} ({} unit(s), depends on {:?})", m.slug, m.version, m.units.len(), m.dependencies);
    }
    println!("OK");
    Ok(())
}

/// An engine over in-memory collaborators with one tenant established.
async fn dry_run_engine(dir: PathBuf) -> Result<(Engine, MemoryTenantDatabases, TenantId)> {
    let defs = DefinitionSet::load_dir(&dir).await?;
    let databases = MemoryTenantDatabases::new();
    let engine = Engine::new(
        defs,
        Arc::new(MemoryControlStore::new()),
        Arc::new(databases.clone()),
        Arc::new(InProcessLock::new()),
        Arc::new(CollectingEventSink::new()),
        EngineSettings::default(),
    );
    let tenant = TenantId::parse(DRY_RUN_TENANT).map_err(anyhow::Error::msg)?;
    engine
        .orchestrator
        .establish_tenant(&tenant, "provisionctl", &CancellationToken::new())
        .await?;
    Ok((engine, databases, tenant))
}

async fn resolve(dir: PathBuf, template: &str, modules: &[String]) -> Result<()> {
    let (engine, _, tenant) = dry_run_engine(dir).await?;
    let (slug, version) = parse_definition_ref(template).map_err(anyhow::Error::msg)?;
    let (_guard, plan) = engine
        .orchestrator
        .prepare_template(&tenant, &slug, version.as_ref(), modules)
        .await?;
    println!("template {}@{}", plan.template.slug, plan.template.version);
    for (i, m) in plan.modules.iter().enumerate() {
        println!("{:>3}. {m}", i + 1);
    }
    Ok(())
}

async fn plan(dir: PathBuf, template: &str, modules: &[String]) -> Result<()> {
    let (engine, databases, tenant) = dry_run_engine(dir).await?;
    let (slug, version) = parse_definition_ref(template).map_err(anyhow::Error::msg)?;
    let outcome = engine
        .orchestrator
        .apply_template(&tenant, &slug, version.as_ref(), modules, "provisionctl")
        .await?;

    let basic = engine.ledger.history(&tenant, Some(Layer::Basic)).await?;
    for entry in &basic {
        println!("{:<9} {}", Layer::Basic.as_str(), entry.unit);
    }
    for call in &outcome.calls {
        for unit in &call.applied {
            println!("{:<9} {unit}", call.layer.as_str());
        }
    }
    let structure = databases.structure(&tenant);
    println!(
        "{} table(s), fingerprint {}",
        structure.tables.len(),
        Fingerprint::of(&structure.normalized()).aggregate
    );
    Ok(())
}

async fn connect() -> Result<Engine> {
    let config = Config::from_env()?;
    let pool = db::create_pool(&config.database_url)
        .await
        .context("connecting to the control plane")?;
    build_engine(&config, pool).await
}

async fn history(tenant: &str, layer: Option<Layer>) -> Result<()> {
    let tenant = TenantId::parse(tenant).map_err(anyhow::Error::msg)?;
    let engine = connect().await?;
    for entry in engine.ledger.history(&tenant, layer).await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

async fn drift(tenant: Option<String>, all: bool) -> Result<()> {
    let engine = connect().await?;
    let tenants = match tenant {
        Some(t) if !all => vec![TenantId::parse(&t).map_err(anyhow::Error::msg)?],
        _ => engine
            .orchestrator
            .tenants()
            .await?
            .into_iter()
            .map(|s| s.tenant)
            .collect(),
    };

    let engine = &engine;
    let results: Vec<_> = stream::iter(tenants)
        .map(|tenant| async move {
            let report = engine.drift.detect(&tenant).await;
            (tenant, report)
        })
        .buffer_unordered(DRIFT_CONCURRENCY)
        .collect()
        .await;

    let mut failures = 0;
    for (tenant, report) in results {
        match report {
            Ok(r) => println!(
                "{:<24} {:<8} score {:>4}  {} table(s) drifted",
                tenant.as_str(),
                r.severity.as_str(),
                r.score,
                r.tables.len()
            ),
            Err(e) => {
                failures += 1;
                println!("{:<24} error    {e}", tenant.as_str());
            }
        }
    }
    if failures > 0 {
        bail!("drift check failed for {failures} tenant(s)");
    }
    Ok(())
}
