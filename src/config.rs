use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// authoritative per-account invite/message limits.
///
/// every rule the limit checker enforces reads its numbers from here; call
/// sites never carry their own copies of these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteLimits {
    /// successful invites per account per utc day
    pub per_account_daily: u32,
    /// successful invites per (account, channel) per utc day
    pub per_channel_daily: u32,
    /// successful invites per (account, channel), ever
    pub per_channel_lifetime: u32,
    /// successful invites per account in a sliding hour
    pub per_account_hourly: u32,
    /// minimum gap between two successful invites on one account
    pub invite_cooldown: Duration,
    /// consecutive invites allowed before the burst cooldown applies
    pub burst_max: u32,
    /// gap that resets the consecutive-invite counter
    pub burst_cooldown: Duration,
    /// direct messages per account per utc day
    pub per_account_daily_messages: u32,
    /// contact additions per account per utc day
    pub per_account_daily_contacts: u32,
}

impl Default for InviteLimits {
    fn default() -> Self {
        Self {
            per_account_daily: 30,
            per_channel_daily: 15,
            per_channel_lifetime: 200,
            per_account_hourly: 2,
            invite_cooldown: Duration::from_secs(15 * 60),
            burst_max: 3,
            burst_cooldown: Duration::from_secs(60 * 60),
            per_account_daily_messages: 40,
            per_account_daily_contacts: 15,
        }
    }
}

/// lock ttls and selection weights for account allocation
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub parse_lock_ttl: Duration,
    pub invite_lock_ttl: Duration,
    pub message_lock_ttl: Duration,
    pub probe_lock_ttl: Duration,
    /// how often a long-lived parse allocation extends its lock
    pub parse_lock_extend_every: Duration,
    /// score = w_usage * usage_today + w_errors * error_count - w_age * idle_minutes
    pub weight_usage: f64,
    pub weight_errors: f64,
    pub weight_age: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            parse_lock_ttl: Duration::from_secs(60 * 60),
            invite_lock_ttl: Duration::from_secs(5 * 60),
            message_lock_ttl: Duration::from_secs(5 * 60),
            probe_lock_ttl: Duration::from_secs(60),
            parse_lock_extend_every: Duration::from_secs(10 * 60),
            weight_usage: 1.0,
            weight_errors: 5.0,
            weight_age: 0.1,
        }
    }
}

/// cool-down recovery worker tuning
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub poll_interval: Duration,
    pub probe_backoff_base: Duration,
    pub probe_backoff_cap: Duration,
    /// consecutive failed probes before the session is disabled
    pub max_probe_failures: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            probe_backoff_base: Duration::from_secs(5 * 60),
            probe_backoff_cap: Duration::from_secs(24 * 60 * 60),
            max_probe_failures: 5,
        }
    }
}

/// parse speed profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedProfile {
    Safe,
    Medium,
    Fast,
}

/// delays and budgets applied to every outbound call of a parse job
#[derive(Debug, Clone, Copy)]
pub struct SpeedSettings {
    pub message_delay: Duration,
    pub user_request_delay: Duration,
    pub batch_size: usize,
    pub requests_per_minute: u32,
}

impl SpeedProfile {
    pub fn settings(&self) -> SpeedSettings {
        match self {
            SpeedProfile::Safe => SpeedSettings {
                message_delay: Duration::from_millis(2000),
                user_request_delay: Duration::from_millis(3000),
                batch_size: 10,
                requests_per_minute: 20,
            },
            SpeedProfile::Medium => SpeedSettings {
                message_delay: Duration::from_millis(800),
                user_request_delay: Duration::from_millis(1500),
                batch_size: 25,
                requests_per_minute: 40,
            },
            SpeedProfile::Fast => SpeedSettings {
                message_delay: Duration::from_millis(200),
                user_request_delay: Duration::from_millis(500),
                batch_size: 50,
                requests_per_minute: 90,
            },
        }
    }

    /// effective inter-message delay: the per-message delay, stretched when it
    /// would let the job exceed the global request budget
    pub fn effective_message_delay(&self) -> Duration {
        let settings = self.settings();
        let budget_floor = Duration::from_secs_f64(60.0 / settings.requests_per_minute as f64);
        settings.message_delay.max(budget_floor)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpeedProfile::Safe => "SAFE",
            SpeedProfile::Medium => "MEDIUM",
            SpeedProfile::Fast => "FAST",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "SAFE" => Some(SpeedProfile::Safe),
            "MEDIUM" => Some(SpeedProfile::Medium),
            "FAST" => Some(SpeedProfile::Fast),
            _ => None,
        }
    }
}

/// immutable configuration record, built once in main and passed into each
/// component
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database_url: Option<String>,
    /// utc hour at which the daily counters roll over
    pub counters_reset_hour: u32,
    /// buffer added on top of a platform-reported flood wait
    pub flood_wait_buffer: Duration,
    /// block duration applied on peer flood
    pub peer_flood_block: Duration,
    /// transient network retries per target
    pub transient_retry_cap: u32,
    /// how long an onboarding login may stay pending before eviction
    pub onboarding_timeout: Duration,
    /// idle grace before the client registry closes a cached connection
    pub client_idle_grace: Duration,
    /// per-call deadline for broker operations
    pub broker_call_timeout: Duration,
    /// messages scanned when probing whether a broadcast channel has comments
    pub comments_probe_depth: usize,
    pub limits: InviteLimits,
    pub allocation: AllocationConfig,
    pub recovery: RecoveryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            counters_reset_hour: 0,
            flood_wait_buffer: Duration::from_secs(60),
            peer_flood_block: Duration::from_secs(24 * 60 * 60),
            transient_retry_cap: 3,
            onboarding_timeout: Duration::from_secs(5 * 60),
            client_idle_grace: Duration::from_secs(10 * 60),
            broker_call_timeout: Duration::from_secs(60),
            comments_probe_depth: 15,
            limits: InviteLimits::default(),
            allocation: AllocationConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// builds the config from environment variables, falling back to the
    /// defaults above for anything unset
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.database_url = env::var("DATABASE_URL").ok();

        if let Some(hour) = read_env_u32("COUNTERS_RESET_HOUR") {
            if hour < 24 {
                config.counters_reset_hour = hour;
            }
        }
        if let Some(secs) = read_env_u64("FLOOD_WAIT_BUFFER_SECS") {
            config.flood_wait_buffer = Duration::from_secs(secs);
        }
        if let Some(cap) = read_env_u32("TRANSIENT_RETRY_CAP") {
            config.transient_retry_cap = cap;
        }
        if let Some(secs) = read_env_u64("ONBOARDING_TIMEOUT_SECS") {
            // the login flow needs at least five minutes to collect a 2fa password
            config.onboarding_timeout = Duration::from_secs(secs.max(5 * 60));
        }

        if let Some(value) = read_env_u32("INVITES_PER_ACCOUNT_DAILY") {
            config.limits.per_account_daily = value;
        }
        if let Some(value) = read_env_u32("INVITES_PER_CHANNEL_DAILY") {
            config.limits.per_channel_daily = value;
        }
        if let Some(value) = read_env_u32("INVITES_PER_CHANNEL_LIFETIME") {
            config.limits.per_channel_lifetime = value;
        }
        if let Some(secs) = read_env_u64("INVITE_COOLDOWN_SECS") {
            config.limits.invite_cooldown = Duration::from_secs(secs);
        }
        if let Some(value) = read_env_u32("MESSAGES_PER_ACCOUNT_DAILY") {
            config.limits.per_account_daily_messages = value;
        }

        config
    }
}

fn read_env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn read_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}
