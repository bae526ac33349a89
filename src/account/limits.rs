use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::config::InviteLimits;
use crate::models::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Invite,
    Message,
    ContactAdd,
    Read,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Invite => "INVITE",
            ActionKind::Message => "MESSAGE",
            ActionKind::ContactAdd => "CONTACT_ADD",
            ActionKind::Read => "READ",
        }
    }
}

/// the rule that denied an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitRule {
    PerAccountDaily,
    PerChannelDaily,
    PerChannelLifetime,
    PerAccountHourly,
    InviteCooldown,
    BurstGuard,
    PerAccountDailyMessages,
    PerAccountDailyContacts,
}

impl LimitRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitRule::PerAccountDaily => "per_account_daily",
            LimitRule::PerChannelDaily => "per_channel_daily",
            LimitRule::PerChannelLifetime => "per_channel_lifetime",
            LimitRule::PerAccountHourly => "per_account_hourly",
            LimitRule::InviteCooldown => "invite_cooldown",
            LimitRule::BurstGuard => "burst_guard",
            LimitRule::PerAccountDailyMessages => "per_account_daily_messages",
            LimitRule::PerAccountDailyContacts => "per_account_daily_contacts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        rule: LimitRule,
        /// earliest moment the action can be retried; `None` for permanent
        /// denials such as the lifetime cap
        retry_after: Option<DateTime<Utc>>,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// next daily counter rollover after `now`
pub fn next_day_boundary(now: DateTime<Utc>, reset_hour: u32) -> DateTime<Utc> {
    let today = SessionRecord::effective_day(now, reset_hour);
    let boundary_time = NaiveTime::from_hms_opt(reset_hour, 0, 0).unwrap();
    (today + Duration::days(1))
        .and_time(boundary_time)
        .and_utc()
}

/// evaluates every applicable rule in table order; the first failing rule
/// wins. the session's daily counters must already be rolled for `now`.
pub fn evaluate(
    limits: &InviteLimits,
    session: &SessionRecord,
    action: ActionKind,
    channel: Option<&str>,
    now: DateTime<Utc>,
    reset_hour: u32,
) -> Decision {
    match action {
        ActionKind::Invite => evaluate_invite(limits, session, channel, now, reset_hour),
        ActionKind::Message => {
            if session.messages_today >= limits.per_account_daily_messages {
                Decision::Deny {
                    rule: LimitRule::PerAccountDailyMessages,
                    retry_after: Some(next_day_boundary(now, reset_hour)),
                }
            } else {
                Decision::Allow
            }
        }
        ActionKind::ContactAdd => {
            if session.contacts_today >= limits.per_account_daily_contacts {
                Decision::Deny {
                    rule: LimitRule::PerAccountDailyContacts,
                    retry_after: Some(next_day_boundary(now, reset_hour)),
                }
            } else {
                Decision::Allow
            }
        }
        ActionKind::Read => Decision::Allow,
    }
}

fn evaluate_invite(
    limits: &InviteLimits,
    session: &SessionRecord,
    channel: Option<&str>,
    now: DateTime<Utc>,
    reset_hour: u32,
) -> Decision {
    if session.invites_today >= limits.per_account_daily {
        return Decision::Deny {
            rule: LimitRule::PerAccountDaily,
            retry_after: Some(next_day_boundary(now, reset_hour)),
        };
    }

    if let Some(channel) = channel {
        let stats = session.channel_stats(channel);
        if stats.invites_today >= limits.per_channel_daily {
            return Decision::Deny {
                rule: LimitRule::PerChannelDaily,
                retry_after: Some(next_day_boundary(now, reset_hour)),
            };
        }
        // after the lifetime cap this account can never invite into the
        // channel again; the caller must obtain a different account
        if stats.invites_lifetime >= limits.per_channel_lifetime {
            return Decision::Deny {
                rule: LimitRule::PerChannelLifetime,
                retry_after: None,
            };
        }
    }

    let hour = Duration::hours(1);
    if session.invites_within(now, hour) >= limits.per_account_hourly {
        let window_start = now - hour;
        let oldest_in_window = session
            .recent_invites
            .iter()
            .filter(|at| **at > window_start)
            .min()
            .copied();
        return Decision::Deny {
            rule: LimitRule::PerAccountHourly,
            retry_after: oldest_in_window.map(|at| at + hour),
        };
    }

    let cooldown = Duration::from_std(limits.invite_cooldown).unwrap_or_default();
    if let Some(last) = session.last_invite_at {
        if now - last < cooldown {
            return Decision::Deny {
                rule: LimitRule::InviteCooldown,
                retry_after: Some(last + cooldown),
            };
        }
    }

    let burst_cooldown = Duration::from_std(limits.burst_cooldown).unwrap_or_default();
    if consecutive_run(&session.recent_invites, burst_cooldown) >= limits.burst_max {
        if let Some(last) = session.recent_invites.iter().max() {
            if now - *last < burst_cooldown {
                return Decision::Deny {
                    rule: LimitRule::BurstGuard,
                    retry_after: Some(*last + burst_cooldown),
                };
            }
        }
    }

    Decision::Allow
}

/// length of the trailing run of invites whose successive gaps all stayed
/// below the burst cooldown
fn consecutive_run(invites: &[DateTime<Utc>], burst_cooldown: Duration) -> u32 {
    let mut sorted: Vec<DateTime<Utc>> = invites.to_vec();
    sorted.sort();
    let mut run = 0u32;
    let mut previous: Option<DateTime<Utc>> = None;
    for at in sorted {
        match previous {
            Some(prev) if at - prev < burst_cooldown => run += 1,
            _ => run = 1,
        }
        previous = Some(at);
    }
    run
}
