use clap::Parser;
use std::io::{self, Write};
use std::sync::Arc;

use tg_orchestra::broker::onboarding::{LoginOutcome, OnboardingManager};
use tg_orchestra::config::OrchestratorConfig;
use tg_orchestra::models::{generate_id, SessionRecord};
use tg_orchestra::secrets::{seal_session_blob, EnvSecretStore, SecretStore};
use tg_orchestra::store::schema::ensure_schema;
use tg_orchestra::store::postgres::{create_pool, PgStateStore};
use tg_orchestra::store::StateStore;

#[derive(Parser)]
#[command(name = "authorize")]
#[command(about = "Register a Telegram session for an owner")]
struct Cli {
    /// owner user id the session belongs to
    #[arg(short, long)]
    owner: i64,

    /// phone number in international format; prompted when omitted
    #[arg(short, long)]
    phone: Option<String>,
}

fn prompt(label: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env();

    let database_url = config
        .database_url
        .clone()
        .ok_or("DATABASE_URL environment variable is required")?;
    let pool = create_pool(&database_url).await?;
    ensure_schema(&pool).await?;
    let store = PgStateStore::new(pool);

    let phone = match cli.phone {
        Some(phone) => phone,
        None => prompt("Enter your phone number (international format, e.g., +1234567890): ")?,
    };

    let secrets = Arc::new(EnvSecretStore::new());
    let onboarding = OnboardingManager::new(secrets.clone(), config.onboarding_timeout);

    println!("Connecting to Telegram...");
    let login_id = onboarding.start_login(&phone).await?;

    let code = prompt("Enter the code you received: ")?;
    let outcome = match onboarding.submit_code(&login_id, &code).await? {
        LoginOutcome::PasswordRequired => {
            let password = prompt("Two-step verification enabled. Enter your password: ")?;
            onboarding.submit_password(&login_id, &password).await?
        }
        outcome => outcome,
    };

    let LoginOutcome::SignedIn {
        session_blob,
        platform_user_id,
    } = outcome
    else {
        return Err("sign-in did not complete".into());
    };

    let session_id = generate_id("sess");
    // the blob is sealed under the per-session key before it ever touches
    // the database
    let session_key = secrets.get_session_key(&session_id).await?;
    let sealed_blob = seal_session_blob(&session_key, &session_blob)?;
    let record = SessionRecord::new(session_id.clone(), cli.owner, phone.clone(), sealed_blob);
    store.create_session(&record).await?;

    println!(
        "Authorization successful! Session {} saved for owner {} (platform user {})",
        session_id, cli.owner, platform_user_id
    );
    Ok(())
}
