// ============================================================================
// scrollgate — operator tool for the scroll gate
// ============================================================================
// Usage:
//   scrollgate validate-config                      Check tier table and catalog
//   scrollgate stats                                Show database statistics
//   scrollgate show-user <USER>                     Print a stored entitlement
//   scrollgate import <FILE>                        Seed entitlements from JSON
//   scrollgate evaluate --user U --content C        Print the access decision
//   scrollgate apply-event --user U [--tier T] ...  Apply a subscription event
//   scrollgate export --format json                 Export entitlements as JSON
//   scrollgate unlock --user U --content C          Drive an unlock session
// ============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use scrollgate_core::unlock::{ChannelEventSink, FanoutEventSink, TracingEventSink};
use scrollgate_core::{
    ContentId, GateConfig, GateDb, ScrollGate, Subscription, SubscriptionStatus,
    SubscriptionUpdate, TierId, UnlockState, UserEntitlement, UserId, ValidatedConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Scroll gate operator tool
#[derive(Parser)]
#[command(name = "scrollgate", version, about = "Inspect and drive the scroll gate")]
struct Cli {
    /// Path to the database file (default: ~/.scrollgate/scrollgate.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Gate configuration JSON (default: $SCROLLGATE_CONFIG or built-in tiers)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration
    ValidateConfig,

    /// Show database statistics (users per tier, passes, preferences)
    Stats,

    /// Print the stored entitlement of a user
    ShowUser {
        user: String,
    },

    /// Seed entitlement records from a JSON array
    Import {
        file: PathBuf,
    },

    /// Evaluate access for a user and scroll
    Evaluate {
        #[arg(long)]
        user: String,

        #[arg(long)]
        content: String,
    },

    /// Apply an external subscription event (billing webhook)
    ApplyEvent {
        #[arg(long)]
        user: String,

        /// New tier id
        #[arg(long)]
        tier: Option<String>,

        /// Set pass ownership
        #[arg(long)]
        pass_owned: Option<bool>,

        /// Subscription status: active, cancelled, expired, none
        #[arg(long)]
        subscription_status: Option<String>,

        /// Subscription expiry (unix seconds)
        #[arg(long, requires = "subscription_status")]
        expiry: Option<i64>,
    },

    /// Export all entitlements as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Run an unlock session and print every transition
    Unlock {
        #[arg(long)]
        user: String,

        #[arg(long)]
        content: String,

        /// Dismiss the upgrade prompt instead of confirming it
        #[arg(long)]
        cancel: bool,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_logging() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scrollgate=info".parse()?)
                .add_directive("scrollgate_core=info".parse()?),
        )
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<ValidatedConfig> {
    let config = match path {
        Some(p) => GateConfig::load(p)?,
        None => GateConfig::from_env()?,
    };
    Ok(config.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let db_path = cli.db_path.as_deref();
    let open_db = || -> Result<Arc<GateDb>> { Ok(Arc::new(GateDb::open(db_path)?)) };

    match cli.command {
        Commands::ValidateConfig => cmd_validate_config(cli.config.as_ref()),
        Commands::Stats => cmd_stats(&*open_db()?),
        Commands::ShowUser { user } => cmd_show_user(&*open_db()?, &user),
        Commands::Import { file } => cmd_import(&*open_db()?, &file),
        Commands::Evaluate { user, content } => {
            let config = load_config(cli.config.as_ref())?;
            cmd_evaluate(config, open_db()?, &user, &content).await
        }
        Commands::ApplyEvent {
            user,
            tier,
            pass_owned,
            subscription_status,
            expiry,
        } => cmd_apply_event(&*open_db()?, &user, tier, pass_owned, subscription_status, expiry),
        Commands::Export { format } => cmd_export(&*open_db()?, &format),
        Commands::Unlock {
            user,
            content,
            cancel,
        } => {
            let config = load_config(cli.config.as_ref())?;
            cmd_unlock(config, open_db()?, &user, &content, cancel).await
        }
    }
}

fn cmd_validate_config(path: Option<&PathBuf>) -> Result<()> {
    let config = load_config(path)?;

    println!("=== Tiers ===");
    for tier in config.tiers.tiers() {
        let capabilities: Vec<&str> = tier.capabilities.iter().map(String::as_str).collect();
        println!(
            "  {:<3} {:<14} {}{}",
            tier.rank,
            tier.id.as_str(),
            capabilities.join(", "),
            if tier.pass_only { " (pass only)" } else { "" }
        );
    }

    println!("\n=== Scrolls ===");
    let mut scrolls: Vec<_> = config.catalog.iter().collect();
    scrolls.sort_by(|a, b| a.content_id.cmp(&b.content_id));
    for req in scrolls {
        println!(
            "  {:<24} tier={:<14} cost={:<6} purchasable={}",
            req.content_id.as_str(),
            req.required_tier.as_ref().map(TierId::as_str).unwrap_or("-"),
            req.credit_cost,
            req.purchasable
        );
    }

    println!(
        "\nConfiguration OK: {} tiers, {} scrolls",
        config.tiers.len(),
        config.catalog.len()
    );
    Ok(())
}

fn cmd_stats(db: &GateDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Scrollgate Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Users:         {} total", stats.total_users);
    let mut tiers: Vec<_> = stats.tier_counts.iter().collect();
    tiers.sort();
    for (tier, count) in tiers {
        println!("  {:12} {}", tier, count);
    }
    println!("Pass holders:  {}", stats.pass_holders);
    println!("Active subs:   {}", stats.active_subscriptions);
    println!("Credits:       {}", stats.total_credits);
    println!("Preferences:   {}", stats.total_preferences);

    Ok(())
}

fn cmd_show_user(db: &GateDb, user: &str) -> Result<()> {
    let user_id = UserId::new(user);
    let Some(record) = db.get_entitlement(&user_id)? else {
        println!("No record for {} (treated as free tier, 0 credits)", user);
        return Ok(());
    };

    let effective = record
        .entitlement
        .clone()
        .normalized(Utc::now().timestamp());
    let output = serde_json::json!({
        "stored": record.entitlement,
        "effective_subscription": effective.subscription.status,
        "updated_at": format_timestamp(record.updated_at),
        "preferences": db.list_preferences(&user_id)?,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_import(db: &GateDb, file: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let records: Vec<UserEntitlement> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid entitlement list in {}", file.display()))?;

    for record in &records {
        db.store_entitlement(record)?;
    }
    println!("Imported {} entitlement records", records.len());
    Ok(())
}

async fn cmd_evaluate(config: ValidatedConfig, db: Arc<GateDb>, user: &str, content: &str) -> Result<()> {
    let gate = ScrollGate::with_db(config, db, Arc::new(TracingEventSink));
    let decision = gate
        .evaluate_access(&UserId::new(user), &ContentId::new(content))
        .await?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn cmd_apply_event(
    db: &GateDb,
    user: &str,
    tier: Option<String>,
    pass_owned: Option<bool>,
    subscription_status: Option<String>,
    expiry: Option<i64>,
) -> Result<()> {
    let subscription = match subscription_status {
        Some(raw) => {
            let status = SubscriptionStatus::parse(&raw).with_context(|| {
                format!(
                    "Unknown subscription status '{}'. Valid values: active, cancelled, expired, none",
                    raw
                )
            })?;
            Some(Subscription { status, expiry })
        }
        None => None,
    };

    let update = SubscriptionUpdate {
        tier: tier.map(TierId::new),
        pass_owned,
        subscription,
    };
    if update.is_empty() {
        anyhow::bail!("Nothing to apply: pass --tier, --pass-owned or --subscription-status");
    }

    let updated = db.apply_subscription_update(&UserId::new(user), &update)?;
    println!("{}", serde_json::to_string_pretty(&updated)?);
    Ok(())
}

fn cmd_export(db: &GateDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let records = db.list_entitlements()?;
    let stats = db.stats()?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "entitlements": records,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn cmd_unlock(
    config: ValidatedConfig,
    db: Arc<GateDb>,
    user: &str,
    content: &str,
    cancel: bool,
) -> Result<()> {
    let channel = ChannelEventSink::default();
    let mut events = channel.subscribe();
    let sink = FanoutEventSink::new(vec![Arc::new(channel), Arc::new(TracingEventSink)]);
    let gate = ScrollGate::with_db(config, db, Arc::new(sink));
    let sweeper = gate.ledger().spawn_expiry_sweeper(Duration::from_secs(5));

    let user_id = UserId::new(user);
    let content_id = ContentId::new(content);
    let decision = gate.evaluate_access(&user_id, &content_id).await?;
    println!("decision: {}", serde_json::to_string(&decision)?);

    let session_id = gate.start_unlock(&user_id, &content_id).await?;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    gate.on_complete(session_id, move |outcome| {
        let _ = done_tx.send(outcome);
    })
    .await?;
    info!("Unlock session {} started", session_id);

    loop {
        let event = events.recv().await?;
        if event.session_id != session_id {
            continue;
        }
        println!("event: {}", serde_json::to_string(&event)?);

        match event.to_state {
            UnlockState::UpgradePrompt if cancel => {
                let outcome = gate.cancel_unlock(session_id).await?;
                println!("cancel: {:?}", outcome);
            }
            UnlockState::UpgradePrompt => {
                let state = gate.confirm_unlock(session_id).await?;
                println!("confirm: {}", state);
            }
            UnlockState::Idle | UnlockState::Complete | UnlockState::Failed => break,
            _ => {}
        }
    }

    let outcome = done_rx.await?;
    println!("outcome: {}", serde_json::to_string(&outcome)?);
    println!("available credits: {}", gate.ledger().balance(&user_id).await?);
    sweeper.abort();
    Ok(())
}
