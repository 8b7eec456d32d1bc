//! Preflight checks: config resolution and database connectivity.

use crate::bootstrap;
use crate::config::Config;
use crate::db::SessionStore;

/// Run the preflight and print a human-readable report.
pub async fn run() -> anyhow::Result<()> {
    println!("parcelflow doctor");
    println!("=================");

    let config = Config::resolve()?;
    println!("[ok] configuration resolved");
    println!("     db backend:   {:?}", config.database.backend);
    println!("     db path:      {}", config.database.path.display());
    println!("     webhook bind: {}", config.webhook.bind_addr);
    println!(
        "     limits:       {}/s global, {}/min global, {}/min per chat",
        config.limits.global_per_sec, config.limits.global_per_min, config.limits.per_chat_per_min
    );
    println!(
        "     session ttl:  {}s (sweep every {}s)",
        config.flow.session_ttl.as_secs(),
        config.flow.sweep_interval.as_secs()
    );
    if config.channel.bot_token.is_none() {
        println!("[!!] PARCELFLOW_BOT_TOKEN is not set; `serve` will refuse to start");
    } else {
        println!("[ok] channel credential present");
    }
    if config.webhook.shared_secret.is_none() {
        println!("[!!] PARCELFLOW_WEBHOOK_SECRET is not set; webhook auth is disabled");
    } else {
        println!("[ok] webhook shared secret present");
    }

    let store = bootstrap::open_database(&config.database).await?;
    println!("[ok] database opened and migrations applied");

    // Exercise one read path so a broken schema surfaces here, not in prod.
    let probe = store.get("__doctor__").await?;
    println!(
        "[ok] session store readable ({} probe row)",
        if probe.is_some() { "found" } else { "no" }
    );

    println!("\nAll checks passed.");
    Ok(())
}
