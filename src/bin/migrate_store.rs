//! Rewrite stored channel subscriptions into the current record layout.
//!
//! Usage: cargo run --bin migrate_store <store.db> [--dry-run]
//!
//! Legacy records carry a single `telegram_chat_id`; they are rewritten with
//! a `telegram_chat_ids` array and a `schema_version` field. Records already
//! at the current version are left alone.

use std::path::PathBuf;

use voxbridge::relay::subscription::{SCHEMA_VERSION, Subscription};
use voxbridge::relay::{KvStore, SqliteStore, StoreError};

const SUBSCRIPTION_MARKER: &str = ":channel_subscriber:";

#[derive(Debug, Default, PartialEq)]
struct Report {
    scanned: usize,
    migrated: usize,
    skipped: usize,
}

fn parse_key(key: &str) -> Option<(u64, u64)> {
    let (guild, channel) = key.split_once(SUBSCRIPTION_MARKER)?;
    Some((guild.parse().ok()?, channel.parse().ok()?))
}

async fn migrate(store: &dyn KvStore, dry_run: bool) -> Result<Report, StoreError> {
    let mut report = Report::default();

    for key in store.keys("").await? {
        let Some((guild_id, channel_id)) = parse_key(&key) else {
            continue;
        };
        report.scanned += 1;

        let fields = store.hgetall(&key).await?;
        let current = fields
            .get("schema_version")
            .is_some_and(|v| v == &SCHEMA_VERSION.to_string());
        if current {
            continue;
        }

        let sub = match Subscription::from_fields(guild_id, channel_id, &fields) {
            Ok(sub) => sub,
            Err(e) => {
                println!("  skip {key}: {e}");
                report.skipped += 1;
                continue;
            }
        };
        println!(
            "  {key}: active={} chats={:?}{}",
            sub.active,
            sub.destination_ids,
            if dry_run { " (dry run)" } else { "" }
        );
        if !dry_run {
            store.del(&key).await?;
            store.hset(&key, &sub.to_fields()).await?;
        }
        report.migrated += 1;
    }
    Ok(report)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let Some(path) = args.iter().skip(1).find(|a| !a.starts_with("--")) else {
        eprintln!("Usage: {} <store.db> [--dry-run]", args[0]);
        std::process::exit(1);
    };
    let path = PathBuf::from(path);
    if !path.exists() {
        eprintln!("Store not found: {}", path.display());
        std::process::exit(1);
    }

    let store = match SqliteStore::open(&path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    println!("Migrating subscriptions in {}", path.display());
    match migrate(&store, dry_run).await {
        Ok(report) => println!(
            "Done: {} scanned, {} migrated, {} skipped",
            report.scanned, report.migrated, report.skipped
        ),
        Err(e) => {
            eprintln!("Migration failed: {e}");
            std::process::exit(1);
        }
    }
}
