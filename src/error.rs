use serde::{Deserialize, Serialize};

/// boxed error alias used by all fallible plumbing
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// closed taxonomy of platform outcomes.
///
/// classification happens exactly once, at the broker boundary; every layer
/// above carries these values as data and never re-interprets raw platform
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// platform requests a pause of n seconds for this session
    FloodWait { seconds: u32 },
    /// platform throttles the session broadly, usually for a day
    PeerFlood,
    PhoneBanned,
    UserDeactivated,
    AuthKeyError,
    /// target user's privacy settings forbid the action
    PrivacyRestricted,
    UserNotFound,
    InvalidIdentifier,
    AlreadyParticipant,
    NotMutualContact,
    /// target belongs to too many channels/groups
    TargetChannelLimit,
    /// group forbids the invite
    GroupRestriction,
    /// socket error, timeout or temporary platform 5xx
    TransientNetwork,
    UnknownPlatformError,
}

impl ErrorKind {
    /// stable machine code persisted in logs and target rows
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::FloodWait { .. } => "FLOOD_WAIT",
            ErrorKind::PeerFlood => "PEER_FLOOD",
            ErrorKind::PhoneBanned => "PHONE_BANNED",
            ErrorKind::UserDeactivated => "USER_DEACTIVATED",
            ErrorKind::AuthKeyError => "AUTH_KEY_ERROR",
            ErrorKind::PrivacyRestricted => "PRIVACY_RESTRICTED",
            ErrorKind::UserNotFound => "USER_NOT_FOUND",
            ErrorKind::InvalidIdentifier => "INVALID_IDENTIFIER",
            ErrorKind::AlreadyParticipant => "ALREADY_PARTICIPANT",
            ErrorKind::NotMutualContact => "NOT_MUTUAL_CONTACT",
            ErrorKind::TargetChannelLimit => "TARGET_CHANNEL_LIMIT",
            ErrorKind::GroupRestriction => "GROUP_RESTRICTION",
            ErrorKind::TransientNetwork => "TRANSIENT_NETWORK",
            ErrorKind::UnknownPlatformError => "UNKNOWN_PLATFORM_ERROR",
        }
    }

    /// fatal for the account: the session is unusable indefinitely
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::PhoneBanned | ErrorKind::UserDeactivated | ErrorKind::AuthKeyError
        )
    }

    /// recoverable for the account after a cool-down
    pub fn is_account_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::FloodWait { .. } | ErrorKind::PeerFlood | ErrorKind::TransientNetwork
        )
    }

    /// terminal for one invite target, without reflecting on the account
    pub fn is_target_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::UserNotFound
                | ErrorKind::PrivacyRestricted
                | ErrorKind::NotMutualContact
                | ErrorKind::AlreadyParticipant
                | ErrorKind::TargetChannelLimit
                | ErrorKind::InvalidIdentifier
        )
    }

    /// failures that do not consume the account's daily budget
    pub fn is_account_fault(&self) -> bool {
        !self.is_target_terminal() && !matches!(self, ErrorKind::GroupRestriction)
    }

    /// human sentence shown to the task owner; explains the cause in the
    /// domain instead of echoing the platform's raw string
    pub fn human_message(&self) -> String {
        match self {
            ErrorKind::FloodWait { seconds } => format!(
                "платформа требует паузу {} сек. для этого аккаунта",
                seconds
            ),
            ErrorKind::PeerFlood => {
                "аккаунт временно ограничен платформой, обычно на сутки".to_string()
            }
            ErrorKind::PhoneBanned => "номер аккаунта заблокирован платформой".to_string(),
            ErrorKind::UserDeactivated => "аккаунт деактивирован".to_string(),
            ErrorKind::AuthKeyError => {
                "сессия аккаунта недействительна, требуется повторная авторизация".to_string()
            }
            ErrorKind::PrivacyRestricted => {
                "настройки приватности пользователя запрещают это действие".to_string()
            }
            ErrorKind::UserNotFound => "пользователь не найден".to_string(),
            ErrorKind::InvalidIdentifier => {
                "идентификатор пользователя некорректен или не может быть разрешён".to_string()
            }
            ErrorKind::AlreadyParticipant => {
                "пользователь уже состоит в этой группе".to_string()
            }
            ErrorKind::NotMutualContact => {
                "действие требует взаимного контакта с пользователем".to_string()
            }
            ErrorKind::TargetChannelLimit => {
                "пользователь состоит в слишком большом количестве каналов/групп".to_string()
            }
            ErrorKind::GroupRestriction => {
                "группа запрещает приглашение участников".to_string()
            }
            ErrorKind::TransientNetwork => {
                "временная сетевая ошибка, попытка будет повторена".to_string()
            }
            ErrorKind::UnknownPlatformError => {
                "платформа вернула неизвестную ошибку".to_string()
            }
        }
    }
}

/// one classified platform failure: the machine kind plus the human sentence
/// attached at the broker boundary
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind) -> Self {
        let message = kind.human_message();
        Self { kind, message }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            message: detail.into(),
        }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl From<ErrorKind> for ClassifiedError {
    fn from(kind: ErrorKind) -> Self {
        ClassifiedError::new(kind)
    }
}

/// maps a platform rpc error name (with the numeric argument already split
/// off, e.g. "FLOOD_WAIT" + 83) into the taxonomy
pub fn classify_rpc(name: &str, value: Option<u32>) -> ErrorKind {
    // some transports hand the raw form through ("FLOOD_WAIT_83")
    let (name, parsed_value) = split_trailing_number(name);
    let value = value.or(parsed_value);

    match name {
        "FLOOD_WAIT" | "FLOOD_TEST_PHONE_WAIT" | "SLOWMODE_WAIT" => ErrorKind::FloodWait {
            seconds: value.unwrap_or(0),
        },
        "PEER_FLOOD" => ErrorKind::PeerFlood,
        "PHONE_NUMBER_BANNED" => ErrorKind::PhoneBanned,
        "USER_DEACTIVATED" | "USER_DEACTIVATED_BAN" => ErrorKind::UserDeactivated,
        "AUTH_KEY_UNREGISTERED" | "AUTH_KEY_INVALID" | "SESSION_REVOKED" | "SESSION_EXPIRED"
        | "AUTH_KEY_DUPLICATED" => ErrorKind::AuthKeyError,
        "USER_PRIVACY_RESTRICTED" => ErrorKind::PrivacyRestricted,
        "USERNAME_NOT_OCCUPIED" | "PHONE_NOT_OCCUPIED" | "CONTACT_NAME_EMPTY" => {
            ErrorKind::UserNotFound
        }
        "USERNAME_INVALID" | "PEER_ID_INVALID" | "USER_ID_INVALID" | "PHONE_NUMBER_INVALID" => {
            ErrorKind::InvalidIdentifier
        }
        "USER_ALREADY_PARTICIPANT" => ErrorKind::AlreadyParticipant,
        "USER_NOT_MUTUAL_CONTACT" => ErrorKind::NotMutualContact,
        "USER_CHANNELS_TOO_MUCH" => ErrorKind::TargetChannelLimit,
        "USERS_TOO_MUCH" | "CHAT_WRITE_FORBIDDEN" | "CHAT_ADMIN_REQUIRED"
        | "CHAT_INVALID" | "CHANNEL_PRIVATE" | "USER_NOT_PARTICIPANT"
        | "INVITE_FORBIDDEN_WITH_JOINAS" => ErrorKind::GroupRestriction,
        "TIMEOUT" | "CONNECTION_NOT_INITED" | "RPC_CALL_FAIL" | "RPC_MCGET_FAIL"
        | "NETWORK_MIGRATE" => ErrorKind::TransientNetwork,
        _ => ErrorKind::UnknownPlatformError,
    }
}

fn split_trailing_number(name: &str) -> (&str, Option<u32>) {
    if let Some(idx) = name.rfind('_') {
        let (head, tail) = name.split_at(idx);
        if let Ok(value) = tail[1..].parse::<u32>() {
            return (head, Some(value));
        }
    }
    (name, None)
}
