use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use latch_gateway::adapters::{CloudLockAdapter, EnvCredentials, SimAdapter};
use latch_gateway::db::{self, AuditQuery};
use latch_gateway::model::{
    Attachment, Device, DeviceKind, LockState, Operation, Portfolio, Property, Role, Scope, Unit,
};
use latch_gateway::{AdapterRegistry, Config, Gateway, StateRefresher};

/// Latch - Authorization and command gateway for smart locks
#[derive(Parser)]
#[command(name = "latch", version, about)]
struct Cli {
    /// Database path override
    #[arg(long, env = "LATCH_DB")]
    db: Option<std::path::PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway with background state refresh until interrupted
    Serve,
    /// Populate a small demo hierarchy against the simulated vendor
    Seed,
    /// Grant a role to an actor at a scope
    Grant {
        /// Acting user performing the grant
        #[arg(long)]
        grantor: String,
        /// Actor receiving the role
        #[arg(long)]
        actor: String,
        /// Scope: "portfolio", "property", or "unit"
        #[arg(long)]
        scope_type: String,
        /// Id of the scoped entity
        #[arg(long)]
        scope_id: String,
        /// Role name (owner, portfolio_admin, property_manager, tenant, guest)
        role: String,
    },
    /// Revoke a role from an actor at a scope
    Revoke {
        #[arg(long)]
        revoker: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        scope_type: String,
        #[arg(long)]
        scope_id: String,
        role: String,
    },
    /// Issue a time-boxed guest grant over a list of devices
    GuestGrant {
        #[arg(long)]
        grantor: String,
        #[arg(long)]
        actor: String,
        /// Window length in hours, starting now
        #[arg(long, default_value = "24")]
        hours: i64,
        /// Device ids covered by the grant
        #[arg(required = true)]
        devices: Vec<String>,
    },
    /// Revoke a guest grant before its window closes
    GuestRevoke {
        #[arg(long)]
        revoker: String,
        grant_id: String,
    },
    /// Execute an operation against a device
    Dispatch {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        device: String,
        /// Operation (read_status, lock, unlock, change_settings, ...)
        operation: String,
    },
    /// Read a device's state, cache-first
    Status {
        #[arg(long)]
        actor: String,
        device: String,
    },
    /// Check an authorization decision without dispatching
    Check {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        device: String,
        operation: String,
    },
    /// Query the access log
    Audit {
        /// Filter by device id
        #[arg(long)]
        device: Option<String>,
        /// Filter by actor id
        #[arg(long)]
        actor: Option<String>,
        /// Max records to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,latch_gateway=info",
        1 => "info,latch_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db_path = cli.db.unwrap_or_else(|| config.db_path.clone());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let pool = db::init(&db_path)?;

    let mut registry = AdapterRegistry::new();
    let credentials = Arc::new(EnvCredentials);
    for vendor in &config.vendors {
        registry.register(Arc::new(CloudLockAdapter::new(
            vendor.name.clone(),
            vendor.base_url.clone(),
            credentials.clone(),
            vendor.request_timeout,
        )));
    }
    // The simulated vendor is always available for seeded setups
    let sim = Arc::new(SimAdapter::new("sim"));
    registry.register(sim.clone());

    let gateway = Gateway::new(pool, registry.clone(), config.dispatch.clone());

    // Seeded sim devices need fleet state on every start
    for device in gateway.entities().list_devices()? {
        if device.vendor == "sim" {
            sim.add_device(&device.id, LockState::Locked).await;
        }
    }

    match cli.command {
        Command::Serve => {
            let refresher = StateRefresher::new(
                registry,
                gateway.cache(),
                gateway.entities().clone(),
                config.refresh_interval,
            );
            tokio::spawn(refresher.run());
            tracing::info!(db = %db_path.display(), "latch gateway ready");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            Ok(())
        }
        Command::Seed => seed(&gateway),
        Command::Grant {
            grantor,
            actor,
            scope_type,
            scope_id,
            role,
        } => {
            let scope = parse_scope(&scope_type, &scope_id)?;
            let role = parse_role(&role)?;
            let association = gateway.grant_role(&grantor, &actor, &scope, role)?;
            println!("granted {} to {actor} ({})", role.as_str(), association.id);
            Ok(())
        }
        Command::Revoke {
            revoker,
            actor,
            scope_type,
            scope_id,
            role,
        } => {
            let scope = parse_scope(&scope_type, &scope_id)?;
            let role = parse_role(&role)?;
            let removed = gateway.revoke_role(&revoker, &actor, &scope, role)?;
            println!("revoked {removed} association(s)");
            Ok(())
        }
        Command::GuestGrant {
            grantor,
            actor,
            hours,
            devices,
        } => {
            let now = Utc::now();
            let grant = gateway.issue_guest_grant(
                &grantor,
                &actor,
                now,
                now + chrono::Duration::hours(hours),
                &devices,
            )?;
            println!("guest grant {} valid until {}", grant.id, grant.valid_until);
            Ok(())
        }
        Command::GuestRevoke { revoker, grant_id } => {
            gateway.revoke_guest_grant(&revoker, &grant_id)?;
            println!("guest grant {grant_id} revoked");
            Ok(())
        }
        Command::Dispatch {
            actor,
            device,
            operation,
        } => {
            let operation = parse_operation(&operation)?;
            let snapshot = gateway.dispatch(&actor, &device, operation).await?;
            println!(
                "{}: {} (battery {})",
                snapshot.device_id,
                snapshot.state.as_str(),
                snapshot
                    .battery_level
                    .map_or_else(|| "n/a".to_string(), |b| format!("{b}%")),
            );
            Ok(())
        }
        Command::Status { actor, device } => {
            let snapshot = gateway
                .get_status(&actor, &device, Duration::from_secs(5))
                .await?;
            println!(
                "{}: {} observed {}",
                snapshot.device_id,
                snapshot.state.as_str(),
                snapshot.observed_at
            );
            Ok(())
        }
        Command::Check {
            actor,
            device,
            operation,
        } => {
            let operation = parse_operation(&operation)?;
            let allowed = gateway.can_perform(&actor, &device, operation)?;
            println!("{}", if allowed { "allowed" } else { "denied" });
            Ok(())
        }
        Command::Audit {
            device,
            actor,
            limit,
        } => {
            let filter = AuditQuery {
                device_id: device,
                actor_id: actor,
                from: None,
                until: None,
                limit: Some(limit),
            };
            for record in gateway.audit_log(&filter)? {
                println!(
                    "{} {} {} {} {}{}",
                    record.requested_at.to_rfc3339(),
                    record.actor_id,
                    record.operation,
                    record.device_id,
                    record.outcome.as_str(),
                    record
                        .denial_reason
                        .as_deref()
                        .map_or_else(String::new, |r| format!(" ({r})")),
                );
            }
            Ok(())
        }
    }
}

/// Populate a demo hierarchy wired to the simulated vendor
fn seed(gateway: &Gateway) -> anyhow::Result<()> {
    let entities = gateway.entities();
    entities.create_portfolio(&Portfolio {
        id: "pf-demo".into(),
        name: "Demo Portfolio".into(),
    })?;
    entities.create_property(&Property {
        id: "prop-1".into(),
        name: "Harbor View".into(),
        portfolio_id: "pf-demo".into(),
    })?;
    entities.create_unit(&Unit {
        id: "unit-1a".into(),
        name: "1A".into(),
        property_id: "prop-1".into(),
    })?;
    entities.create_device(&Device {
        id: "lock-1a-front".into(),
        name: "1A Front Door".into(),
        vendor: "sim".into(),
        kind: DeviceKind::Lock,
        attachment: Attachment::Unit("unit-1a".into()),
        is_online: true,
        remote_operation_enabled: true,
    })?;
    entities.create_device(&Device {
        id: "lock-lobby".into(),
        name: "Lobby Door".into(),
        vendor: "sim".into(),
        kind: DeviceKind::Lock,
        attachment: Attachment::Property("prop-1".into()),
        is_online: true,
        remote_operation_enabled: true,
    })?;

    // Bootstrap the owner directly; everything else goes through grant_role
    let association = gateway.bootstrap_owner("alice", &Scope::Portfolio("pf-demo".into()))?;
    println!("seeded demo hierarchy; owner 'alice' ({})", association.id);
    Ok(())
}

fn parse_scope(scope_type: &str, scope_id: &str) -> anyhow::Result<Scope> {
    Scope::from_parts(scope_type, scope_id).ok_or_else(|| {
        anyhow!("unknown scope type '{scope_type}' (expected portfolio, property, or unit)")
    })
}

fn parse_role(s: &str) -> anyhow::Result<Role> {
    Role::parse(s).ok_or_else(|| anyhow!("unknown role '{s}'"))
}

fn parse_operation(s: &str) -> anyhow::Result<Operation> {
    Operation::parse(s).ok_or_else(|| anyhow!("unknown operation '{s}'"))
}
