use clap::Parser;
use log::{info, warn};
use std::sync::Arc;

use tg_orchestra::account::recovery::RecoveryWorker;
use tg_orchestra::account::AccountManager;
use tg_orchestra::broker::onboarding::OnboardingManager;
use tg_orchestra::broker::telegram::TelegramBroker;
use tg_orchestra::broker::SessionBroker;
use tg_orchestra::clock::SystemClock;
use tg_orchestra::config::OrchestratorConfig;
use tg_orchestra::engine::{EngineDispatcher, InviteEngine, ParseEngine};
use tg_orchestra::secrets::EnvSecretStore;
use tg_orchestra::store::memory::{MemoryLockStore, MemoryStateStore};
use tg_orchestra::store::schema::ensure_schema;
use tg_orchestra::store::postgres::{create_pool, PgLockStore, PgStateStore};
use tg_orchestra::store::{LockStore, StateStore};
use tg_orchestra::telemetry::Telemetry;

#[derive(Parser)]
#[command(name = "tg-orchestra")]
#[command(about = "Telegram account orchestration daemon")]
struct Args {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // initialize rustls crypto provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // load .env file if it exists
    if let Err(e) = dotenvy::dotenv() {
        match e {
            dotenvy::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // .env file not found, which is fine
            }
            _ => {
                eprintln!("warning: failed to load .env file: {}", e);
            }
        }
    }

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let _args = Args::parse();

    let config = OrchestratorConfig::from_env();
    info!("Starting orchestrator...");

    // state and lock stores: postgres when configured, in-memory otherwise
    let (state_store, lock_store): (Arc<dyn StateStore>, Arc<dyn LockStore>) =
        match &config.database_url {
            Some(url) => {
                info!("Initializing database...");
                let pool = create_pool(url).await?;
                ensure_schema(&pool).await?;
                (
                    Arc::new(PgStateStore::new(pool.clone())),
                    Arc::new(PgLockStore::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set, running with in-memory state");
                (
                    Arc::new(MemoryStateStore::new()),
                    Arc::new(MemoryLockStore::new()),
                )
            }
        };

    let clock = Arc::new(SystemClock);
    let telemetry = Arc::new(Telemetry::new());
    let secrets = Arc::new(EnvSecretStore::new());

    // the broker owns every live platform connection
    let broker = Arc::new(TelegramBroker::new(secrets.clone(), &config));
    tokio::spawn(broker.registry().run_janitor());

    // pending logins are evicted after the onboarding timeout
    let onboarding = Arc::new(OnboardingManager::new(
        secrets.clone(),
        config.onboarding_timeout,
    ));
    tokio::spawn(onboarding.clone().run_janitor());

    let accounts = Arc::new(AccountManager::new(
        state_store.clone(),
        lock_store.clone(),
        clock.clone(),
        config.clone(),
        telemetry.clone(),
    ));

    // maintenance loop that wakes cooled-down sessions
    let recovery = Arc::new(RecoveryWorker::new(
        state_store.clone(),
        lock_store.clone(),
        broker.clone() as Arc<dyn SessionBroker>,
        clock.clone(),
        config.clone(),
        telemetry.clone(),
    ));
    tokio::spawn(recovery.run());

    let invite_engine = Arc::new(InviteEngine::new(
        state_store.clone(),
        accounts.clone(),
        broker.clone() as Arc<dyn SessionBroker>,
        clock.clone(),
        config.clone(),
        telemetry.clone(),
    ));
    let parse_engine = Arc::new(ParseEngine::new(
        state_store.clone(),
        accounts.clone(),
        broker.clone() as Arc<dyn SessionBroker>,
        clock.clone(),
        config.clone(),
        telemetry.clone(),
    ));

    let dispatcher = Arc::new(EngineDispatcher::new(
        state_store,
        invite_engine,
        parse_engine,
        clock,
    ));

    info!("Orchestrator ready");
    dispatcher.run().await;

    Ok(())
}
