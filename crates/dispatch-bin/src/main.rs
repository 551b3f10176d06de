//! Command Dispatcher - outbox dispatcher daemon and operator CLI.

mod app;

use std::path::PathBuf;

use app::AppContext;
use clap::{Args, Parser, Subcommand, ValueEnum};
use dispatch_config_and_utils::{init_logging, Config, Paths};
use dispatch_database::FeatureStatus;

/// Command dispatcher command-line interface.
#[derive(Parser)]
#[command(name = "command-dispatcher")]
#[command(about = "Reliable command dispatch: outbox dispatcher and operator tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, database). Defaults to ~/.command-dispatch
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the outbox dispatcher until interrupted
    Run,
    /// Submit a command through the admission pipeline
    ///
    /// Routes and feature status are enforced. Token-bucket limits are held in
    /// process memory, so each invocation starts with a full bucket and a
    /// single CLI submit is never throttled.
    Submit(SubmitArgs),
    /// Manage command routes
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// Manage command feature flags and limits
    Feature {
        #[command(subcommand)]
        action: FeatureAction,
    },
    /// Show outbox row counts per status
    Status,
    /// Move a dead event back to pending with a fresh retry budget
    Replay {
        /// Event id (dispatch id) of the dead event
        event_id: String,
    },
    /// Delete delivered events older than the given age
    PurgeDelivered {
        #[arg(long)]
        older_than_secs: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Command name, e.g. order.create
    pub command: String,
    #[arg(long)]
    pub tenant: String,
    /// JSON payload
    #[arg(long, default_value = "{}")]
    pub payload: String,
    #[arg(long)]
    pub aggregate_type: Option<String>,
    /// Partition key for the command; defaults to the tenant
    #[arg(long)]
    pub aggregate_id: Option<String>,
    #[arg(long)]
    pub correlation_id: Option<String>,
    #[arg(long)]
    pub initiated_by: Option<String>,
    #[arg(long)]
    pub idempotency_key: Option<String>,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,
    /// Execute synchronously on the target service instead of queueing
    #[arg(long)]
    pub now: bool,
}

#[derive(Subcommand)]
enum RouteAction {
    /// Create or update a route
    Set(RouteSetArgs),
    /// List routes
    List {
        #[arg(long)]
        command: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RouteSetArgs {
    pub command: String,
    #[arg(long)]
    pub topic: String,
    #[arg(long)]
    pub service: String,
    /// Tenant override; omit for the global route
    #[arg(long)]
    pub tenant: Option<String>,
    #[arg(long, default_value_t = 100)]
    pub weight: u32,
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Subcommand)]
enum FeatureAction {
    /// Create or update a feature row
    Set(FeatureSetArgs),
    /// List feature rows
    List {
        #[arg(long)]
        command: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct FeatureSetArgs {
    pub command: String,
    #[arg(long, value_enum, default_value_t = FeatureStatusArg::Enabled)]
    pub status: FeatureStatusArg,
    /// Tenant override; omit for the global row
    #[arg(long)]
    pub tenant: Option<String>,
    #[arg(long)]
    pub max_per_minute: Option<i64>,
    #[arg(long)]
    pub burst: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeatureStatusArg {
    Enabled,
    Observation,
    Disabled,
}

impl From<FeatureStatusArg> for FeatureStatus {
    fn from(arg: FeatureStatusArg) -> Self {
        match arg {
            FeatureStatusArg::Enabled => FeatureStatus::Enabled,
            FeatureStatusArg::Observation => FeatureStatus::Observation,
            FeatureStatusArg::Disabled => FeatureStatus::Disabled,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    // Initialize logging
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));
    let ctx = AppContext::open(config, paths).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => app::run_dispatcher(ctx).await?,
        Commands::Submit(args) => {
            if args.now {
                app::print_json(&app::execute_now(&ctx, args).await?)?;
            } else {
                app::print_json(&app::submit(&ctx, args).await?)?;
            }
        }
        Commands::Route { action } => match action {
            RouteAction::Set(args) => app::print_json(&app::set_route(&ctx, args).await?)?,
            RouteAction::List { command } => app::print_json(&app::list_routes(&ctx, command).await?)?,
        },
        Commands::Feature { action } => match action {
            FeatureAction::Set(args) => app::print_json(&app::set_feature(&ctx, args).await?)?,
            FeatureAction::List { command } => {
                app::print_json(&app::list_features(&ctx, command).await?)?
            }
        },
        Commands::Status => app::print_status(&app::status(&ctx).await?),
        Commands::Replay { event_id } => {
            if app::replay(&ctx, &event_id).await? {
                println!("Requeued {}", event_id);
            } else {
                anyhow::bail!("event {} is not dead", event_id);
            }
        }
        Commands::PurgeDelivered { older_than_secs } => {
            let purged = app::purge_delivered(&ctx, older_than_secs).await?;
            println!("Purged {} delivered events", purged);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submit_with_options() {
        let cli = Cli::try_parse_from([
            "command-dispatcher",
            "submit",
            "order.create",
            "--tenant",
            "tenant-a",
            "--payload",
            r#"{"orderId":"o-1"}"#,
            "--idempotency-key",
            "k-1",
            "--priority",
            "-5",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Submit(args)) => {
                assert_eq!(args.command, "order.create");
                assert_eq!(args.tenant, "tenant-a");
                assert_eq!(args.idempotency_key.as_deref(), Some("k-1"));
                assert_eq!(args.priority, -5);
                assert!(!args.now);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn parses_operator_commands() {
        let cli = Cli::try_parse_from(["command-dispatcher", "purge-delivered", "--older-than-secs", "3600"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::PurgeDelivered { older_than_secs: 3600 })
        ));

        let cli = Cli::try_parse_from([
            "command-dispatcher",
            "feature",
            "set",
            "order.create",
            "--status",
            "observation",
            "--burst",
            "10",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Feature {
                action: FeatureAction::Set(args),
            }) => {
                assert_eq!(FeatureStatus::from(args.status), FeatureStatus::Observation);
                assert_eq!(args.burst, Some(10));
                assert_eq!(args.max_per_minute, None);
            }
            _ => panic!("expected feature set"),
        }

        let cli = Cli::try_parse_from(["command-dispatcher", "--log-level", "debug"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_unknown_feature_status() {
        assert!(Cli::try_parse_from([
            "command-dispatcher",
            "feature",
            "set",
            "order.create",
            "--status",
            "paused",
        ])
        .is_err());
    }
}
