//! shardlog: read encrypted, time-sharded message archives.
//!
//! Every subcommand prints JSON on stdout; logs go to stderr.

mod archive;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardlog_catalog::{CancelToken, MessageRouter, ShardWatcher};
use shardlog_crypto::CipherProfile;
use shardlog_types::query::split_list;
use shardlog_types::{MessageQuery, UnixSeconds};
use tracing::info;

use crate::config::ShardlogConfig;

#[derive(Parser)]
#[command(name = "shardlog")]
#[command(about = "Query encrypted, time-sharded message archives", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file. Defaults to $SHARDLOG_DATA_DIR/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Archive root, overriding `archive.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Hex key, overriding `archive.key`.
    #[arg(long, global = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered shards
    Shards,

    /// Query messages across shards
    Messages {
        /// Conversation ids, comma separated
        #[arg(short, long)]
        talker: String,

        /// Start time, Unix seconds
        #[arg(long, default_value_t = 0)]
        start: UnixSeconds,

        /// End time, Unix seconds
        #[arg(long)]
        end: Option<UnixSeconds>,

        /// Sender user names, comma separated
        #[arg(long)]
        sender: Option<String>,

        /// Regular expression matched against message text
        #[arg(short, long)]
        keyword: Option<String>,

        /// Maximum messages to return (0 = all)
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,

        /// Print rendered text instead of raw content
        #[arg(long)]
        plain: bool,
    },

    /// Stream every message of the given conversations (all if none)
    Dump {
        /// Conversation ids, comma separated
        #[arg(short, long)]
        talker: Option<String>,
    },

    /// Totals across every conversation
    Stats,

    /// Message counts per group conversation
    Groups {
        /// Group ids, comma separated
        groups: String,
    },

    /// Sent/received counts per month
    Trend {
        /// Most recent months to keep (0 = all)
        #[arg(long, default_value_t = 0)]
        months: usize,
    },

    /// Message counts by hour of day and weekday
    Heatmap,

    /// Check the configured key against a shard's first page
    CheckKey {
        /// Shard file. Defaults to the first shard in the shard directory.
        shard: Option<PathBuf>,
    },

    /// Keep the catalog current as shard files appear
    Watch {
        /// Seconds between catalog reports
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[derive(Serialize)]
struct KeyCheck {
    shard: PathBuf,
    profile: String,
    valid: bool,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ShardlogConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.archive.data_dir = dir.display().to_string();
    }
    if let Some(key) = &cli.key {
        config.archive.key = key.clone();
    }

    // RUST_LOG wins over the configured level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("shardlog={}", config.advanced.log_level)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Shards => {
            let catalog = archive::open_catalog(&config)?;
            print_json(&catalog.list_shards())?;
        }

        Commands::Messages {
            talker,
            start,
            end,
            sender,
            keyword,
            limit,
            offset,
            plain,
        } => {
            let router = MessageRouter::new(archive::open_catalog(&config)?);
            let mut query = MessageQuery::new(split_list(&talker))
                .between(start, end.unwrap_or(UnixSeconds::MAX))
                .page(limit.unwrap_or(config.query.default_limit), offset);
            if let Some(sender) = sender {
                query = query.senders(split_list(&sender));
            }
            if let Some(keyword) = keyword {
                query = query.keyword(keyword);
            }

            let mut messages = router.get_messages(&query, &CancelToken::new())?;
            if plain {
                for message in &mut messages {
                    message.content = message.plain_text();
                }
            }
            print_json(&messages)?;
        }

        Commands::Dump { talker } => {
            let router = MessageRouter::new(archive::open_catalog(&config)?);
            let talkers = talker.as_deref().map(split_list).unwrap_or_default();
            let mut count = 0u64;
            router.iterate_messages(&talkers, &CancelToken::new(), |message| {
                count += 1;
                let line = serde_json::to_string(&message).map_err(std::io::Error::other)?;
                println!("{line}");
                Ok(())
            })?;
            info!(count, "dump finished");
        }

        Commands::Stats => {
            let router = MessageRouter::new(archive::open_catalog(&config)?);
            print_json(&router.global_stats(&CancelToken::new())?)?;
        }

        Commands::Groups { groups } => {
            let router = MessageRouter::new(archive::open_catalog(&config)?);
            print_json(&router.group_message_counts(&split_list(&groups), &CancelToken::new())?)?;
        }

        Commands::Trend { months } => {
            let router = MessageRouter::new(archive::open_catalog(&config)?);
            print_json(&router.monthly_trend(months, &CancelToken::new())?)?;
        }

        Commands::Heatmap => {
            let router = MessageRouter::new(archive::open_catalog(&config)?);
            print_json(&router.heatmap(&CancelToken::new())?)?;
        }

        Commands::CheckKey { shard } => {
            let shard = match shard {
                Some(path) => path,
                None => archive::first_shard(&config.shard_dir())?,
            };
            let profile = CipherProfile::resolve(config.archive.platform, config.archive.version);
            let valid = archive::check_key(&shard, &config.archive.key, profile)?;
            print_json(&KeyCheck {
                shard,
                profile: profile.name(),
                valid,
            })?;
            if !valid {
                anyhow::bail!("key does not match");
            }
        }

        Commands::Watch { interval } => {
            let catalog = archive::open_catalog(&config)?;
            let _watcher = ShardWatcher::start(catalog.clone()).context("cannot watch shard directory")?;
            info!(dir = %catalog.shard_dir().display(), "watching for new shards");

            let mut reported = Vec::new();
            loop {
                let shards = catalog.list_shards();
                if shards != reported {
                    println!("{}", serde_json::to_string(&shards)?);
                    reported = shards;
                }
                std::thread::sleep(Duration::from_secs(interval.max(1)));
            }
        }
    }

    Ok(())
}
