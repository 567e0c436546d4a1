//! forgeflow CLI entry point

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use forgeflow::{
    config::Config,
    error::{Error, Result},
    extract::extract_tenants,
    forge::build_client,
    models::{ForgeType, Tenant, TimePeriod},
    schedule,
    store::{ControlDb, NewRepository, TenantStore},
    transform::transform_tenants,
    workflow::Dispatcher,
};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(version, about = "Incremental source-forge crawler deriving delivery metrics", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize forgeflow configuration and the control database
    Init {
        /// Base directory for config and databases (defaults to ~/.forgeflow)
        #[arg(long)]
        base_dir: Option<PathBuf>,

        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run one extraction pass
    Extract {
        /// Restrict to one tenant
        #[arg(short, long)]
        tenant: Option<String>,

        /// Window start (RFC 3339); requires --to
        #[arg(long)]
        from: Option<String>,

        /// Window end (RFC 3339); requires --from
        #[arg(long)]
        to: Option<String>,
    },

    /// Run one transform pass (correlate and compute metrics)
    Transform {
        /// Restrict to one tenant
        #[arg(short, long)]
        tenant: Option<String>,

        /// Window start (RFC 3339); requires --to
        #[arg(long)]
        from: Option<String>,

        /// Window end (RFC 3339); requires --from
        #[arg(long)]
        to: Option<String>,
    },

    /// Run the periodic scheduler (extract then transform each tick)
    Run {
        /// Restrict to one tenant
        #[arg(short, long)]
        tenant: Option<String>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Manage tenants in the control database
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Manage repositories registered for a tenant
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Show registered tenants and their repositories, or inspect one
    /// crawl's audit trail
    Status {
        /// Tenant whose ledger to inspect (required with --crawl-id)
        #[arg(short, long)]
        tenant: Option<String>,

        /// Print the audit trail of one crawl instance
        #[arg(long)]
        crawl_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    /// Register or update a tenant
    Add {
        /// Tenant id
        id: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// Tenant database file, relative to the tenant directory unless absolute
        #[arg(long)]
        db: Option<String>,

        /// Crawl user id; tenants without one are skipped by extraction
        #[arg(long)]
        crawl_user: Option<String>,
    },

    /// List registered tenants
    List,
}

#[derive(Subcommand)]
enum RepoAction {
    /// Fetch a repository's metadata and register it for crawling
    Add {
        /// Tenant id
        #[arg(short, long)]
        tenant: String,

        /// Forge the repository lives on (github or gitlab)
        #[arg(short, long)]
        forge: ForgeType,

        /// Forge-side repository path, e.g. acme/api
        path: String,
    },

    /// List repositories registered for a tenant
    List {
        /// Tenant id
        #[arg(short, long)]
        tenant: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::Init { base_dir, force } = &cli.command {
        return handle_init(base_dir.clone(), *force).await;
    }

    let config = match cli.config.as_deref() {
        Some(path) => Config::load(path)?,
        None => Config::load_from(None)?,
    };
    let control = ControlDb::connect(&config).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),

        Commands::Extract { tenant, from, to } => {
            let period = parse_window(from, to, config.extract_window())?;
            let dispatcher = Dispatcher::new();
            let summary =
                extract_tenants(&config, &control, &dispatcher, tenant.as_deref(), period).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Extracted {} merge requests across {} repositories ({} tenants, {} failures)",
                    summary.merge_requests, summary.repositories, summary.tenants, summary.failures
                );
            }
        }

        Commands::Transform { tenant, from, to } => {
            let default_window = config.extract_window();
            let period = match (&from, &to) {
                (None, None) => {
                    TimePeriod::last(default_window).offset_back(config.transform_offset())
                }
                _ => parse_window(from, to, default_window)?,
            };
            let period = TimePeriod::new(period.from, period.to)?;
            let dispatcher = Dispatcher::new();
            let summary =
                transform_tenants(&config, &control, &dispatcher, tenant.as_deref(), period)
                    .await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Computed {} metric rows across {} repositories ({} tenants, {} failures)",
                    summary.metrics, summary.repositories, summary.tenants, summary.failures
                );
            }
        }

        Commands::Run { tenant, once } => {
            if once {
                let dispatcher = Dispatcher::new();
                schedule::run_cycle(&config, &control, &dispatcher, tenant.as_deref()).await?;
            } else {
                schedule::run(&config, &control, tenant.as_deref()).await?;
            }
        }

        Commands::Tenant { action } => match action {
            TenantAction::Add {
                id,
                name,
                db,
                crawl_user,
            } => {
                let tenant = Tenant {
                    name: name.unwrap_or_else(|| id.clone()),
                    db_locator: db.unwrap_or_else(|| format!("{}.db", id)),
                    crawl_user_id: crawl_user,
                    id,
                };
                control.upsert_tenant(&tenant).await?;
                // create the tenant database up front so registration failures
                // surface here, not mid-crawl
                TenantStore::open(&config, &tenant).await?;
                println!("Registered tenant {}", tenant.id);
            }
            TenantAction::List => {
                let tenants = control.list_tenants().await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&tenants)?);
                } else {
                    for tenant in tenants {
                        let credential = if tenant.crawl_user_id.is_some() {
                            "crawlable"
                        } else {
                            "no credential"
                        };
                        println!("{}  {}  ({})", tenant.id, tenant.name, credential);
                    }
                }
            }
        },

        Commands::Repo { action } => match action {
            RepoAction::Add {
                tenant,
                forge,
                path,
            } => {
                let tenant = control
                    .get_tenant(&tenant)
                    .await?
                    .ok_or_else(|| Error::TenantNotFound(tenant))?;
                let store = TenantStore::open(&config, &tenant).await?;
                let client = build_client(&config, forge)?;

                let fetched = client.fetch_repository(&path).await?;
                let repository = store
                    .upsert_repository(&NewRepository {
                        external_id: fetched.external_id,
                        name: fetched.name,
                        namespace_id: fetched.namespace_id,
                        namespace_name: fetched.namespace_name,
                        forge_type: forge.to_string(),
                    })
                    .await?;
                println!(
                    "Registered {}/{} (id {}) for tenant {}",
                    repository.namespace_name, repository.name, repository.id, tenant.id
                );
            }
            RepoAction::List { tenant } => {
                let tenant = control
                    .get_tenant(&tenant)
                    .await?
                    .ok_or_else(|| Error::TenantNotFound(tenant))?;
                let store = TenantStore::open(&config, &tenant).await?;
                let repositories = store.list_repositories().await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&repositories)?);
                } else {
                    for repo in repositories {
                        println!(
                            "{}  {}/{}  [{}]",
                            repo.id, repo.namespace_name, repo.name, repo.forge_type
                        );
                    }
                }
            }
        },

        Commands::Status { tenant, crawl_id } => {
            if let Some(crawl_id) = crawl_id {
                let tenant = tenant.ok_or_else(|| {
                    Error::Validation("--crawl-id requires --tenant".into())
                })?;
                let tenant = control
                    .get_tenant(&tenant)
                    .await?
                    .ok_or_else(|| Error::TenantNotFound(tenant))?;
                let store = TenantStore::open(&config, &tenant).await?;
                let events = store.crawl_events(&crawl_id).await?;

                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&events)?);
                } else {
                    for event in events {
                        println!(
                            "{}  {:8}  {}  {}",
                            event.timestamp.to_rfc3339(),
                            event.detail,
                            event.namespace,
                            event.data.as_deref().unwrap_or("")
                        );
                    }
                }
                return Ok(());
            }

            let tenants = control.list_tenants().await?;
            if cli.json {
                let mut entries = Vec::new();
                for tenant in &tenants {
                    let store = TenantStore::open(&config, tenant).await?;
                    let repositories = store.list_repositories().await?;
                    entries.push(serde_json::json!({
                        "tenant": tenant.id,
                        "crawlable": tenant.crawl_user_id.is_some(),
                        "repositories": repositories.len(),
                    }));
                }
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("Tenants: {}", tenants.len());
                for tenant in &tenants {
                    let store = TenantStore::open(&config, tenant).await?;
                    let repositories = store.list_repositories().await?;
                    println!(
                        "  {}  {} repositories{}",
                        tenant.id,
                        repositories.len(),
                        if tenant.crawl_user_id.is_some() {
                            ""
                        } else {
                            "  (no crawl credential)"
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

async fn handle_init(base_dir: Option<PathBuf>, force: bool) -> Result<()> {
    let config = Config::with_base_dir(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {} (use --force to overwrite)",
            config.paths.config_file.display()
        )));
    }

    config.save()?;
    std::fs::create_dir_all(&config.paths.tenant_db_dir)?;
    ControlDb::open(&config.paths.control_db_file).await?;

    println!("Initialized forgeflow in {}", config.paths.base_dir.display());
    println!("  config:     {}", config.paths.config_file.display());
    println!("  control db: {}", config.paths.control_db_file.display());
    Ok(())
}

/// Resolve the crawl window from CLI args, or fall back to a rolling window
/// ending now. Malformed or partial windows are rejected before any
/// workflow is submitted.
fn parse_window(
    from: Option<String>,
    to: Option<String>,
    default_window: chrono::Duration,
) -> Result<TimePeriod> {
    match (from, to) {
        (None, None) => {
            let window = TimePeriod::last(default_window);
            TimePeriod::new(window.from, window.to)
        }
        (Some(from), Some(to)) => {
            let from = parse_instant(&from)?;
            let to = parse_instant(&to)?;
            TimePeriod::new(from, to)
        }
        _ => Err(Error::Validation(
            "--from and --to must be given together".into(),
        )),
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Invalid timestamp {:?}: {}", value, e)))
}
