mod gateway;

use clap::{Parser, Subcommand};
use coursebot_channels::{TelegramChannel, VkChannel};
use coursebot_core::{
    config::{self, shellexpand, Config},
    domain::{InvalidationPayload, SignalKey, SignalPurpose},
    message::ChannelKind,
    traits::{ChannelBackend, InvalidationSignal, TaskStore},
};
use coursebot_memory::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "coursebot",
    version,
    about = "Course reminders and long-poll bots for Telegram and VK"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bots.
    Start {
        /// Run only this channel (telegram or vk).
        #[arg(long)]
        channel: Option<ChannelKind>,
    },
    /// Show configuration and pending task counts.
    Status,
    /// Ask a running bot to cancel reminders and recompute courses.
    Invalidate {
        #[arg(long)]
        channel: ChannelKind,
        /// Firing key (`task:trigger`) to cancel. Repeatable.
        #[arg(long = "key")]
        keys: Vec<String>,
        /// Course id to recompute. Repeatable.
        #[arg(long = "course")]
        courses: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { channel } => {
            let cfg = config::load(&cli.config)?;
            let _guard = init_logging(&cfg)?;

            let backends = build_backends(&cfg, channel)?;
            if backends.is_empty() {
                anyhow::bail!("No channels enabled. Enable at least one channel in config.toml.");
            }

            let store = Store::new(&cfg.store).await?;
            let stores = gateway::Stores::sqlite(store);

            println!("coursebot: starting {} channel(s)...", backends.len());
            gateway::Gateway::new(backends, &stores, &cfg).run().await?;
        }
        Commands::Status => {
            init_stdout_logging();
            let cfg = config::load(&cli.config)?;
            println!("coursebot status\n");
            println!("Config: {}", cli.config);
            println!("Database: {}", shellexpand(&cfg.store.db_path));
            println!(
                "Reconcile hours: {:?} | entity sweep hours: {:?}",
                cfg.scheduler.reconcile_hours, cfg.scheduler.entity_sweep_hours
            );
            println!();

            let store = Store::new(&cfg.store).await?;
            let tasks = store.get_all().await?;
            for kind in [ChannelKind::Telegram, ChannelKind::Vk] {
                let configured = match kind {
                    ChannelKind::Telegram => cfg.channel.telegram.as_ref().map(|c| {
                        (c.enabled, !c.bot_token.is_empty())
                    }),
                    ChannelKind::Vk => cfg.channel.vk.as_ref().map(|c| {
                        (c.enabled, !c.group_token.is_empty())
                    }),
                };
                let status = match configured {
                    Some((true, true)) => "configured",
                    Some((true, false)) => "enabled but missing token",
                    Some((false, _)) => "disabled",
                    None => "not configured",
                };
                let pending = tasks.iter().filter(|t| t.channel == kind).count();
                let signal = store
                    .get(SignalKey::new(kind, SignalPurpose::UpdateTasks))
                    .await?
                    .map_or("none", |_| "pending");
                println!("  {kind}: {status} | {pending} task(s) | invalidation: {signal}");
            }
        }
        Commands::Invalidate {
            channel,
            keys,
            courses,
        } => {
            init_stdout_logging();
            let payload = InvalidationPayload {
                deleted_firing_keys: keys,
                entity_ids: courses,
            };
            if payload.is_empty() {
                anyhow::bail!("nothing to invalidate. Pass --key and/or --course.");
            }
            let cfg = config::load(&cli.config)?;
            let store = Store::new(&cfg.store).await?;
            gateway::notify(&store, channel, &payload).await?;
            println!(
                "Invalidation written for {channel}: {} key(s), {} course(s)",
                payload.deleted_firing_keys.len(),
                payload.entity_ids.len()
            );
        }
    }

    Ok(())
}

/// Stdout plus a non-blocking file writer under `{data_dir}/logs`. The guard
/// must live until exit or buffered lines are lost.
fn init_logging(cfg: &Config) -> anyhow::Result<WorkerGuard> {
    let log_dir = PathBuf::from(shellexpand(&cfg.bot.data_dir)).join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, "coursebot.log"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.bot.log_level)))
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    Ok(guard)
}

fn init_stdout_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

/// Build the enabled channel backends, optionally narrowed to one.
fn build_backends(
    cfg: &Config,
    only: Option<ChannelKind>,
) -> anyhow::Result<Vec<Arc<dyn ChannelBackend>>> {
    let wanted = |kind: ChannelKind| only.is_none_or(|k| k == kind);
    let timeout = cfg.session.long_poll_timeout_secs;
    let mut backends: Vec<Arc<dyn ChannelBackend>> = Vec::new();

    if let Some(ref tg) = cfg.channel.telegram {
        if tg.enabled && wanted(ChannelKind::Telegram) {
            if tg.bot_token.is_empty() {
                anyhow::bail!(
                    "Telegram is enabled but bot_token is empty. \
                     Set it in config.toml or TELEGRAM_BOT_TOKEN env var."
                );
            }
            backends.push(Arc::new(TelegramChannel::new(tg, timeout)));
        }
    }

    if let Some(ref vk) = cfg.channel.vk {
        if vk.enabled && wanted(ChannelKind::Vk) {
            if vk.group_token.is_empty() {
                anyhow::bail!(
                    "VK is enabled but group_token is empty. \
                     Set it in config.toml or VK_GROUP_TOKEN env var."
                );
            }
            if vk.group_id == 0 {
                anyhow::bail!("VK is enabled but group_id is not set.");
            }
            backends.push(Arc::new(VkChannel::new(vk, timeout)));
        }
    }

    Ok(backends)
}
