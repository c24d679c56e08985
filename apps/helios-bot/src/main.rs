mod bot;
mod config;
mod messenger;
mod panel;
mod services;
mod texts;
mod web;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use dotenvy::dotenv;
use helios_db::repositories::{KeyRepository, LedgerRepository, ReferralRepository};
use messenger::{Messenger, TelegramMessenger};
use panel::XuiPanel;
use services::{
    BackupService, BroadcastService, LifecycleService, ProvisionService, ReferralService,
};
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LIFECYCLE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const BACKUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Pause between outbound messages in a sweep, to stay under the
/// Telegram rate limit.
const SEND_THROTTLE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: KeyRepository,
    pub ledger: LedgerRepository,
    pub provision: Arc<ProvisionService>,
    pub referrals: Arc<ReferralService>,
    pub broadcast: Arc<BroadcastService>,
}

#[derive(Parser)]
#[command(name = "helios-bot")]
#[command(about = "Helios VPN key bot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot, the payment webhook and the background sweeps
    Serve,
    /// Take one database snapshot and exit
    Backup,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Backup => backup_once(config).await,
    }
}

async fn serve(config: Arc<Config>) -> Result<()> {
    info!("Starting Helios bot...");

    let pool = helios_db::connect(&config.database_url).await?;
    let keys = KeyRepository::new(pool.clone());
    let ledger = LedgerRepository::new(pool.clone());
    let referral_repo = ReferralRepository::new(pool.clone());

    let bot = Bot::new(config.bot_token.clone());
    let me = bot.get_me().await.context("Bot identity check failed")?;
    let messenger: Arc<dyn Messenger> =
        Arc::new(TelegramMessenger::new(bot.clone(), me.id));
    let panel = Arc::new(XuiPanel::new(
        config.panel_username.clone(),
        config.panel_password.clone(),
    ));

    let provision = Arc::new(ProvisionService::new(
        keys.clone(),
        ledger.clone(),
        panel.clone(),
        config.clone(),
    ));
    let referrals = Arc::new(ReferralService::new(
        referral_repo,
        ledger.clone(),
        messenger.clone(),
    ));
    let lifecycle = Arc::new(LifecycleService::new(
        keys.clone(),
        ledger.clone(),
        panel,
        messenger.clone(),
        config.clone(),
        SEND_THROTTLE,
    ));
    let broadcast = Arc::new(BroadcastService::new(
        ledger.clone(),
        messenger.clone(),
        SEND_THROTTLE,
    ));
    let backups = Arc::new(BackupService::new(
        pool,
        messenger.clone(),
        config.backup_dir.clone(),
        config.admin_chat_id,
    ));

    let state = AppState {
        config: config.clone(),
        keys,
        ledger: ledger.clone(),
        provision,
        referrals: referrals.clone(),
        broadcast,
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Hourly key-lifecycle sweep. Ticks never overlap: the next one
    // waits for the previous to finish.
    let mut shutdown = shutdown_tx.subscribe();
    let sweep = lifecycle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIFECYCLE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = sweep.run_tick(now_ms).await {
                        error!("Lifecycle tick failed: {:#}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });

    let mut shutdown = shutdown_tx.subscribe();
    let snapshots = backups.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BACKUP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = snapshots.run_once(chrono::Utc::now()).await {
                        error!("Backup failed: {:#}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });

    let app = web::router(web::WebState {
        ledger,
        referrals,
        messenger,
    });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Payment webhook listening on {}", config.bind_addr);

    let mut shutdown = shutdown_tx.subscribe();
    let web_task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!("Web server failed: {}", e);
        }
    });

    let bot_shutdown = shutdown_tx.subscribe();
    let bot_task = tokio::spawn(bot::run_bot(bot, bot_shutdown, state));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    let _ = bot_task.await;
    let _ = web_task.await;
    info!("Helios bot stopped");
    Ok(())
}

/// One-shot snapshot for cron or pre-upgrade use. Skips the operator
/// upload since the bot is not running here.
async fn backup_once(config: Arc<Config>) -> Result<()> {
    struct NullMessenger;

    #[async_trait::async_trait]
    impl Messenger for NullMessenger {
        async fn is_blocked(&self, _tg_id: i64) -> bool {
            false
        }
        async fn send(
            &self,
            _tg_id: i64,
            _text: &str,
            _action: Option<messenger::Action>,
        ) -> Result<()> {
            Ok(())
        }
        async fn send_document(&self, _chat_id: i64, _path: &std::path::Path) -> Result<()> {
            Ok(())
        }
    }

    let pool = helios_db::connect(&config.database_url).await?;
    let backups = BackupService::new(
        pool,
        Arc::new(NullMessenger),
        config.backup_dir.clone(),
        config.admin_chat_id,
    );
    let path = backups.run_once(chrono::Utc::now()).await?;
    info!("Snapshot written to {}", path.display());
    Ok(())
}
