use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tg_orchestra::broker::{
    normalize_handle, AdminRights, EntityDescriptor, EntityKind, HistoryBatch, ParticipantBatch,
    SessionBroker, SessionRef, TargetIdentity,
};
use tg_orchestra::config::SpeedProfile;
use tg_orchestra::error::{ClassifiedError, ErrorKind};

/// scripted session broker: tests register entities, queue per-target and
/// per-channel outcomes, and inspect the recorded call log afterwards
#[derive(Default)]
pub struct MockBroker {
    entities: Mutex<HashMap<String, EntityDescriptor>>,
    comments_enabled: Mutex<HashMap<i64, bool>>,
    /// (session_id, channel_id) pairs holding invite rights
    admins: Mutex<HashSet<(String, i64)>>,
    /// queued invite outcomes per target key; default is success
    invite_results: Mutex<HashMap<String, VecDeque<Result<(), ErrorKind>>>>,
    /// queued history batches per channel id
    history: Mutex<HashMap<i64, VecDeque<Result<HistoryBatch, ErrorKind>>>>,
    participants: Mutex<HashMap<i64, VecDeque<Result<ParticipantBatch, ErrorKind>>>>,
    probe_results: Mutex<HashMap<String, VecDeque<Result<(), ErrorKind>>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&self, handle: &str, entity: EntityDescriptor) {
        let key = normalize_handle(handle).unwrap_or_else(|| handle.to_string());
        self.entities.lock().unwrap().insert(key, entity);
    }

    pub fn register_user(&self, username: &str, user_id: i64) {
        self.register_entity(
            username,
            EntityDescriptor {
                platform_id: user_id,
                access_hash: Some(user_id * 7),
                kind: EntityKind::User,
                username: Some(username.trim_start_matches('@').to_string()),
                title: username.trim_start_matches('@').to_string(),
            },
        );
    }

    pub fn register_community(&self, handle: &str, channel_id: i64, kind: EntityKind) {
        self.register_entity(
            handle,
            EntityDescriptor {
                platform_id: channel_id,
                access_hash: Some(channel_id * 13),
                kind,
                username: normalize_handle(handle).map(|h| h.trim_start_matches('@').to_string()),
                title: handle.to_string(),
            },
        );
    }

    pub fn set_comments_enabled(&self, channel_id: i64, enabled: bool) {
        self.comments_enabled
            .lock()
            .unwrap()
            .insert(channel_id, enabled);
    }

    pub fn grant_invite_rights(&self, session_id: &str, channel_id: i64) {
        self.admins
            .lock()
            .unwrap()
            .insert((session_id.to_string(), channel_id));
    }

    pub fn queue_invite_result(&self, target: &str, result: Result<(), ErrorKind>) {
        self.invite_results
            .lock()
            .unwrap()
            .entry(target.trim_start_matches('@').to_string())
            .or_default()
            .push_back(result);
    }

    pub fn queue_history(&self, channel_id: i64, result: Result<HistoryBatch, ErrorKind>) {
        self.history
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push_back(result);
    }

    pub fn queue_participants(
        &self,
        channel_id: i64,
        result: Result<ParticipantBatch, ErrorKind>,
    ) {
        self.participants
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push_back(result);
    }

    pub fn queue_probe_result(&self, session_id: &str, result: Result<(), ErrorKind>) {
        self.probe_results
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn target_key(target: &TargetIdentity) -> String {
        if let Some(username) = &target.username {
            return username.trim_start_matches('@').to_string();
        }
        if let Some(phone) = &target.phone {
            return phone.clone();
        }
        if let Some(id) = target.platform_user_id {
            return id.to_string();
        }
        "<none>".to_string()
    }
}

#[async_trait]
impl SessionBroker for MockBroker {
    async fn resolve_entity(
        &self,
        session: &SessionRef,
        handle: &str,
    ) -> Result<EntityDescriptor, ClassifiedError> {
        self.record(format!("resolve:{}:{}", session.session_id, handle));
        let key = normalize_handle(handle).unwrap_or_else(|| handle.to_string());
        self.entities
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| ClassifiedError::new(ErrorKind::UserNotFound))
    }

    async fn verify_admin_rights(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        required_permissions: &[String],
    ) -> Result<AdminRights, ClassifiedError> {
        self.record(format!(
            "verify_admin:{}:{}",
            session.session_id, channel.platform_id
        ));
        let is_admin = self
            .admins
            .lock()
            .unwrap()
            .contains(&(session.session_id.clone(), channel.platform_id));
        let permissions: Vec<String> = if is_admin {
            vec!["invite_users".to_string(), "ban_users".to_string()]
        } else {
            Vec::new()
        };
        let has_required = is_admin
            && required_permissions
                .iter()
                .all(|permission| permissions.iter().any(|granted| granted == permission));
        Ok(AdminRights {
            is_admin,
            permissions,
            has_required,
        })
    }

    async fn check_comments_enabled(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
    ) -> Result<bool, ClassifiedError> {
        self.record(format!(
            "check_comments:{}:{}",
            session.session_id, channel.platform_id
        ));
        if matches!(channel.kind, EntityKind::Group | EntityKind::Megagroup) {
            return Ok(true);
        }
        Ok(self
            .comments_enabled
            .lock()
            .unwrap()
            .get(&channel.platform_id)
            .copied()
            .unwrap_or(false))
    }

    async fn fetch_history(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        _profile: SpeedProfile,
        _offset_id: Option<i32>,
    ) -> Result<HistoryBatch, ClassifiedError> {
        self.record(format!(
            "fetch_history:{}:{}",
            session.session_id, channel.platform_id
        ));
        let next = self
            .history
            .lock()
            .unwrap()
            .get_mut(&channel.platform_id)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(kind)) => Err(ClassifiedError::new(kind)),
            None => Ok(HistoryBatch::default()),
        }
    }

    async fn fetch_participants(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        _profile: SpeedProfile,
        _offset: usize,
    ) -> Result<ParticipantBatch, ClassifiedError> {
        self.record(format!(
            "fetch_participants:{}:{}",
            session.session_id, channel.platform_id
        ));
        let next = self
            .participants
            .lock()
            .unwrap()
            .get_mut(&channel.platform_id)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(kind)) => Err(ClassifiedError::new(kind)),
            None => Ok(ParticipantBatch::default()),
        }
    }

    async fn send_invite(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        target: &TargetIdentity,
    ) -> Result<(), ClassifiedError> {
        let key = Self::target_key(target);
        self.record(format!(
            "send_invite:{}:{}:{}",
            session.session_id, channel.platform_id, key
        ));
        let next = self
            .invite_results
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(())) | None => Ok(()),
            Some(Err(kind)) => Err(ClassifiedError::new(kind)),
        }
    }

    async fn send_direct_message(
        &self,
        session: &SessionRef,
        target: &TargetIdentity,
        _text: &str,
    ) -> Result<(), ClassifiedError> {
        let key = Self::target_key(target);
        self.record(format!("send_dm:{}:{}", session.session_id, key));
        let next = self
            .invite_results
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(())) | None => Ok(()),
            Some(Err(kind)) => Err(ClassifiedError::new(kind)),
        }
    }

    async fn probe_session(&self, session: &SessionRef) -> Result<(), ClassifiedError> {
        self.record(format!("probe:{}", session.session_id));
        let next = self
            .probe_results
            .lock()
            .unwrap()
            .get_mut(&session.session_id)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(())) | None => Ok(()),
            Some(Err(kind)) => Err(ClassifiedError::new(kind)),
        }
    }

    async fn disconnect(&self, session_id: &str) {
        self.record(format!("disconnect:{}", session_id));
    }
}
