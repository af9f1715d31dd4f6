use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "mailwatch",
    version,
    about = "Mailbox change-notification receiver for Microsoft Graph"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the notification receiver and renewal scheduler
    Serve,
    /// Inspect and manage subscriptions
    Subscriptions {
        #[command(subcommand)]
        command: SubscriptionCommands,
    },
    /// Run one renewal pass and print what it did
    Tick,
}

#[derive(Debug, Subcommand)]
enum SubscriptionCommands {
    /// List stored subscriptions
    List {
        /// Only show subscriptions in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Create a subscription (defaults to the configured mailbox Inbox)
    Create(CreateArgs),
    /// Renew one subscription now
    Renew { id: String },
    /// Delete a subscription remotely and mark it expired
    Retire { id: String },
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    resource: Option<String>,
    /// Comma-separated change kinds, e.g. created,updated
    #[arg(long)]
    change_type: Option<String>,
    #[arg(long)]
    ttl_minutes: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Context, Result};
    use chrono::Duration;

    use mailwatch::config::Config;
    use mailwatch::db::models::{ChangeType, SubscriptionState};
    use mailwatch::output::{self, OutputFormat};
    use mailwatch::service::Runtime;
    use mailwatch::subscriptions::MAX_SUBSCRIPTION_TTL_MINUTES;

    use super::{Cli, Commands, CreateArgs, SubscriptionCommands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        match cli.command {
            Commands::Serve => handle_serve().await,
            Commands::Subscriptions { command } => match command {
                SubscriptionCommands::List { state } => handle_list(state, format),
                SubscriptionCommands::Create(args) => handle_create(args, format).await,
                SubscriptionCommands::Renew { id } => handle_renew(&id, format).await,
                SubscriptionCommands::Retire { id } => handle_retire(&id, format).await,
            },
            Commands::Tick => handle_tick(format).await,
        }
    }

    fn runtime() -> Result<Runtime> {
        let config = Config::from_env().context("load mailwatch configuration")?;
        Runtime::build(config).context("initialise mailwatch runtime")
    }

    async fn handle_serve() -> Result<()> {
        let runtime = Arc::new(runtime()?);
        runtime.serve().await.context("serve notifications")
    }

    fn handle_list(state: Option<String>, format: OutputFormat) -> Result<()> {
        let filter = state
            .as_deref()
            .map(str::parse::<SubscriptionState>)
            .transpose()
            .map_err(|error| anyhow!(error))?;
        let runtime = runtime()?;
        let states = filter.map(|state| [state]);
        let subscriptions = runtime
            .manager()
            .list(states.as_ref().map(|states| states.as_slice()))?;
        let views = subscriptions
            .iter()
            .map(|subscription| subscription.view())
            .collect::<Vec<_>>();
        println!("{}", output::format_subscriptions(format, &views)?);
        Ok(())
    }

    async fn handle_create(args: CreateArgs, format: OutputFormat) -> Result<()> {
        let runtime = runtime()?;
        let config = runtime.config();
        let resource = args
            .resource
            .or_else(|| config.default_resource())
            .ok_or_else(|| anyhow!("--resource is required when AZURE_USER_ID is unset"))?;
        let change_type = match args.change_type {
            Some(raw) => raw.parse::<ChangeType>().map_err(|error| anyhow!(error))?,
            None => config.change_type.clone(),
        };
        let ttl = match args.ttl_minutes {
            Some(minutes) if minutes <= 0 => bail!("--ttl-minutes must be positive"),
            Some(minutes) => Duration::minutes(minutes.min(MAX_SUBSCRIPTION_TTL_MINUTES)),
            None => config.subscription_ttl,
        };

        let subscription = runtime
            .manager()
            .create(&resource, &change_type, ttl)
            .await
            .with_context(|| format!("create subscription for {resource}"))?;
        println!("{}", output::format_subscription(format, &subscription.view())?);
        Ok(())
    }

    async fn handle_renew(id: &str, format: OutputFormat) -> Result<()> {
        let runtime = runtime()?;
        let subscription = runtime
            .manager()
            .renew(id)
            .await
            .with_context(|| format!("renew subscription '{id}'"))?;
        println!("{}", output::format_subscription(format, &subscription.view())?);
        Ok(())
    }

    async fn handle_retire(id: &str, format: OutputFormat) -> Result<()> {
        let runtime = runtime()?;
        let subscription = runtime
            .manager()
            .retire(id)
            .await
            .with_context(|| format!("retire subscription '{id}'"))?;
        println!("{}", output::format_subscription(format, &subscription.view())?);
        Ok(())
    }

    async fn handle_tick(format: OutputFormat) -> Result<()> {
        let runtime = runtime()?;
        let report = runtime.scheduler().tick().await;
        println!("{}", output::format_tick_report(format, &report)?);
        Ok(())
    }
}
