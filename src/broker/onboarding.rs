use grammers_client::types::{LoginToken, PasswordToken};
use grammers_client::{Client, Config, InitParams, SignInError};
use grammers_session::Session;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::BoxError;
use crate::models::generate_id;
use crate::secrets::SecretStore;

/// one login in progress.
///
/// the client stays connected across the whole flow: the code (and, with
/// 2fa, the password) must be submitted on the same live client that
/// requested them.
struct PendingLogin {
    client: Client,
    phone: String,
    login_token: Option<LoginToken>,
    password_token: Option<PasswordToken>,
    started_at: Instant,
}

#[derive(Debug)]
pub enum LoginOutcome {
    SignedIn {
        session_blob: Vec<u8>,
        platform_user_id: i64,
    },
    /// two-step verification enabled; submit the password next
    PasswordRequired,
}

/// registry of live onboarding clients, keyed by an opaque login id.
///
/// entries are evicted (and their clients disconnected) after the timeout,
/// which is never below five minutes so a slow 2fa entry still completes.
pub struct OnboardingManager {
    secrets: Arc<dyn SecretStore>,
    pending: Mutex<HashMap<String, PendingLogin>>,
    timeout: Duration,
}

impl OnboardingManager {
    pub fn new(secrets: Arc<dyn SecretStore>, timeout: Duration) -> Self {
        Self {
            secrets,
            pending: Mutex::new(HashMap::new()),
            timeout: timeout.max(Duration::from_secs(5 * 60)),
        }
    }

    /// connects a fresh client and requests the login code; the client is
    /// kept live under the returned login id
    pub async fn start_login(&self, phone: &str) -> Result<String, BoxError> {
        let credentials = self.secrets.get_platform_credentials().await?;

        let client = Client::connect(Config {
            session: Session::new(),
            api_id: credentials.api_id,
            api_hash: credentials.api_hash.clone(),
            params: InitParams {
                ..Default::default()
            },
        })
        .await?;

        let login_token = client.request_login_code(phone).await?;

        let login_id = generate_id("login");
        let mut pending = self.pending.lock().await;
        pending.insert(
            login_id.clone(),
            PendingLogin {
                client,
                phone: phone.to_string(),
                login_token: Some(login_token),
                password_token: None,
                started_at: Instant::now(),
            },
        );
        info!("Login started for {} ({})", phone, login_id);
        Ok(login_id)
    }

    /// completes the sign-in with the sms/app code on the same live client
    pub async fn submit_code(&self, login_id: &str, code: &str) -> Result<LoginOutcome, BoxError> {
        let mut entry = {
            let mut pending = self.pending.lock().await;
            pending
                .remove(login_id)
                .ok_or("login not found or expired")?
        };

        let token = entry.login_token.take().ok_or("login code already used")?;

        match entry.client.sign_in(&token, code).await {
            Ok(user) => {
                let session_blob = entry.client.session().save();
                info!("Login completed for {}", entry.phone);
                Ok(LoginOutcome::SignedIn {
                    session_blob,
                    platform_user_id: user.id(),
                })
            }
            Err(SignInError::PasswordRequired(password_token)) => {
                entry.password_token = Some(password_token);
                let mut pending = self.pending.lock().await;
                pending.insert(login_id.to_string(), entry);
                Ok(LoginOutcome::PasswordRequired)
            }
            Err(e) => {
                // keep the entry so the owner can retry with a fresh code
                warn!("Sign-in failed for {}: {}", entry.phone, e);
                let mut pending = self.pending.lock().await;
                pending.insert(login_id.to_string(), entry);
                Err(e.to_string().into())
            }
        }
    }

    /// finishes a two-step login with the account password
    pub async fn submit_password(
        &self,
        login_id: &str,
        password: &str,
    ) -> Result<LoginOutcome, BoxError> {
        let mut entry = {
            let mut pending = self.pending.lock().await;
            pending
                .remove(login_id)
                .ok_or("login not found or expired")?
        };

        let token = entry
            .password_token
            .take()
            .ok_or("no password was requested for this login")?;

        match entry.client.check_password(token, password).await {
            Ok(user) => {
                let session_blob = entry.client.session().save();
                info!("Two-step login completed for {}", entry.phone);
                Ok(LoginOutcome::SignedIn {
                    session_blob,
                    platform_user_id: user.id(),
                })
            }
            Err(e) => {
                warn!("Password check failed for {}: {}", entry.phone, e);
                Err(e.to_string().into())
            }
        }
    }

    /// evicts logins older than the timeout; dropping the entry disconnects
    /// its client
    pub async fn sweep_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        let timeout = self.timeout;
        pending.retain(|_, entry| entry.started_at.elapsed() < timeout);
        let evicted = before - pending.len();
        if evicted > 0 {
            info!("Evicted {} expired onboarding login(s)", evicted);
        }
        evicted
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn run_janitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.sweep_expired().await;
        }
    }
}
