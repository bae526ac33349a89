use async_trait::async_trait;
use grammers_client::{Client, Config, InitParams, InvocationError};
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;
use log::{info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::registry::ClientRegistry;
use super::{
    looks_like_phone, normalize_handle, AdminRights, EntityDescriptor, EntityKind, HistoryBatch,
    HistoryMessage, ParticipantBatch, ParticipantInfo, SessionBroker, SessionRef, TargetIdentity,
};
use crate::config::{OrchestratorConfig, SpeedProfile};
use crate::error::{classify_rpc, ClassifiedError, ErrorKind};
use crate::secrets::{open_session_blob, SecretStore};

/// every named admin permission, granted wholesale to creators
const ALL_PERMISSIONS: &[&str] = &[
    "change_info",
    "post_messages",
    "edit_messages",
    "delete_messages",
    "ban_users",
    "invite_users",
    "pin_messages",
    "add_admins",
    "manage_call",
];

type OpFuture<T> = Pin<Box<dyn Future<Output = Result<T, InvocationError>> + Send>>;

/// live-connection broker on the grammers mtproto client.
///
/// connections are opened lazily from the session blob, cached in the
/// registry while in use, and re-opened once if the link drops mid-operation.
pub struct TelegramBroker {
    secrets: Arc<dyn SecretStore>,
    registry: Arc<ClientRegistry>,
    call_timeout: Duration,
    comments_probe_depth: usize,
}

impl TelegramBroker {
    pub fn new(secrets: Arc<dyn SecretStore>, config: &OrchestratorConfig) -> Self {
        Self {
            secrets,
            registry: Arc::new(ClientRegistry::new(config.client_idle_grace)),
            call_timeout: config.broker_call_timeout,
            comments_probe_depth: config.comments_probe_depth,
        }
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// returns the cached client for the session, connecting and
    /// re-authenticating from the restored blob when there is none
    async fn ensure_client(&self, session: &SessionRef) -> Result<Client, ClassifiedError> {
        if let Some(entry) = self.registry.get(&session.session_id).await {
            return Ok(entry.client.clone());
        }

        // the stored blob is sealed; only the per-session key opens it
        let session_key = self
            .secrets
            .get_session_key(&session.session_id)
            .await
            .map_err(|e| ClassifiedError::with_detail(ErrorKind::UnknownPlatformError, e.to_string()))?;
        let opened = open_session_blob(&session_key, &session.session_blob).map_err(|e| {
            ClassifiedError::with_detail(ErrorKind::AuthKeyError, e.to_string())
        })?;

        let restored = Session::load(&opened).map_err(|e| {
            ClassifiedError::with_detail(
                ErrorKind::AuthKeyError,
                format!("session blob failed to restore: {}", e),
            )
        })?;

        let credentials = self
            .secrets
            .get_platform_credentials()
            .await
            .map_err(|e| ClassifiedError::with_detail(ErrorKind::UnknownPlatformError, e.to_string()))?;

        info!("Connecting client for session {}", session.session_id);
        let client = Client::connect(Config {
            session: restored,
            api_id: credentials.api_id,
            api_hash: credentials.api_hash.clone(),
            params: InitParams {
                ..Default::default()
            },
        })
        .await
        .map_err(|e| {
            ClassifiedError::with_detail(
                ErrorKind::TransientNetwork,
                format!("connect failed: {}", e),
            )
        })?;

        let authorized = client.is_authorized().await.map_err(|e| {
            ClassifiedError::with_detail(ErrorKind::TransientNetwork, e.to_string())
        })?;
        if !authorized {
            return Err(ClassifiedError::new(ErrorKind::AuthKeyError));
        }

        self.registry.insert(&session.session_id, client.clone()).await;
        Ok(client)
    }

    /// runs one platform operation under the per-client lock and the call
    /// deadline; a dropped link is reconnected once, then the error sticks
    async fn run_op<T, F>(&self, session: &SessionRef, f: F) -> Result<T, ClassifiedError>
    where
        T: Send,
        F: Fn(Client) -> OpFuture<T>,
    {
        let mut reconnected = false;
        loop {
            self.ensure_client(session).await?;
            let entry = self
                .registry
                .get(&session.session_id)
                .await
                .ok_or_else(|| ClassifiedError::new(ErrorKind::TransientNetwork))?;
            let _guard = entry.op_lock.lock().await;
            entry.touch();

            let classified = match tokio::time::timeout(self.call_timeout, f(entry.client.clone()))
                .await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => classify_invocation(&e),
                Err(_) => ClassifiedError::with_detail(
                    ErrorKind::TransientNetwork,
                    "platform call deadline exceeded",
                ),
            };

            if classified.kind == ErrorKind::TransientNetwork && !reconnected {
                warn!(
                    "Session {} lost its link mid-operation, reconnecting",
                    session.session_id
                );
                drop(_guard);
                self.registry.remove(&session.session_id).await;
                reconnected = true;
                continue;
            }
            return Err(classified);
        }
    }

    /// resolves a target's identifiers to an input user for invites
    async fn resolve_input_user(
        &self,
        session: &SessionRef,
        target: &TargetIdentity,
    ) -> Result<tl::types::InputUser, ClassifiedError> {
        if let Some(username) = &target.username {
            let entity = self.resolve_entity(session, username).await?;
            if !matches!(entity.kind, EntityKind::User | EntityKind::Bot) {
                return Err(ClassifiedError::new(ErrorKind::InvalidIdentifier));
            }
            return Ok(tl::types::InputUser {
                user_id: entity.platform_id,
                access_hash: entity.access_hash.unwrap_or(0),
            });
        }
        if let Some(phone) = &target.phone {
            let entity = self.resolve_entity(session, phone).await?;
            return Ok(tl::types::InputUser {
                user_id: entity.platform_id,
                access_hash: entity.access_hash.unwrap_or(0),
            });
        }
        if let Some(user_id) = target.platform_user_id {
            // no access hash on record; the platform accepts this only for
            // peers the session has already seen
            return Ok(tl::types::InputUser {
                user_id,
                access_hash: 0,
            });
        }
        Err(ClassifiedError::new(ErrorKind::InvalidIdentifier))
    }
}

fn classify_invocation(e: &InvocationError) -> ClassifiedError {
    match e {
        InvocationError::Rpc(rpc) => ClassifiedError::new(classify_rpc(&rpc.name, rpc.value)),
        _ => ClassifiedError::with_detail(ErrorKind::TransientNetwork, e.to_string()),
    }
}

fn entity_kind(ty: PackedType) -> EntityKind {
    match ty {
        PackedType::User => EntityKind::User,
        PackedType::Bot => EntityKind::Bot,
        PackedType::Chat => EntityKind::Group,
        PackedType::Megagroup | PackedType::Gigagroup => EntityKind::Megagroup,
        PackedType::Broadcast => EntityKind::Broadcast,
    }
}

fn packed_from_entity(entity: &EntityDescriptor) -> PackedChat {
    let ty = match entity.kind {
        EntityKind::User => PackedType::User,
        EntityKind::Bot => PackedType::Bot,
        EntityKind::Group => PackedType::Chat,
        EntityKind::Megagroup => PackedType::Megagroup,
        EntityKind::Broadcast => PackedType::Broadcast,
    };
    PackedChat {
        ty,
        id: entity.platform_id,
        access_hash: entity.access_hash,
    }
}

fn input_channel(entity: &EntityDescriptor) -> tl::enums::InputChannel {
    tl::types::InputChannel {
        channel_id: entity.platform_id,
        access_hash: entity.access_hash.unwrap_or(0),
    }
    .into()
}

fn descriptor_from_chat(chat: &grammers_client::types::Chat) -> EntityDescriptor {
    let packed = chat.pack();
    EntityDescriptor {
        platform_id: packed.id,
        access_hash: packed.access_hash,
        kind: entity_kind(packed.ty),
        username: chat.username().map(|name| name.to_string()),
        title: chat.name().to_string(),
    }
}

fn descriptor_from_tl_user(user: &tl::types::User) -> EntityDescriptor {
    let mut title = user.first_name.clone().unwrap_or_default();
    if let Some(last_name) = &user.last_name {
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(last_name);
    }
    EntityDescriptor {
        platform_id: user.id,
        access_hash: user.access_hash,
        kind: if user.bot { EntityKind::Bot } else { EntityKind::User },
        username: user.username.clone(),
        title,
    }
}

fn admin_rights_permissions(rights: &tl::types::ChatAdminRights) -> Vec<String> {
    let mut permissions = Vec::new();
    let flags = [
        ("change_info", rights.change_info),
        ("post_messages", rights.post_messages),
        ("edit_messages", rights.edit_messages),
        ("delete_messages", rights.delete_messages),
        ("ban_users", rights.ban_users),
        ("invite_users", rights.invite_users),
        ("pin_messages", rights.pin_messages),
        ("add_admins", rights.add_admins),
        ("manage_call", rights.manage_call),
    ];
    for (name, granted) in flags {
        if granted {
            permissions.push(name.to_string());
        }
    }
    permissions
}

fn rights_from_permissions(permissions: Vec<String>, required: &[String]) -> AdminRights {
    let has_required = required
        .iter()
        .all(|permission| permissions.iter().any(|granted| granted == permission));
    AdminRights {
        is_admin: true,
        permissions,
        has_required,
    }
}

fn no_rights() -> AdminRights {
    AdminRights {
        is_admin: false,
        permissions: Vec::new(),
        has_required: false,
    }
}

fn media_kind_name(media: &grammers_client::types::Media) -> &'static str {
    use grammers_client::types::Media;
    match media {
        Media::Photo(_) => "photo",
        Media::Document(_) => "document",
        Media::Sticker(_) => "sticker",
        Media::Contact(_) => "contact",
        Media::Poll(_) => "poll",
        _ => "other",
    }
}

fn message_reply_count(message: &grammers_client::types::Message) -> Option<i32> {
    message.raw.replies.as_ref().map(|replies| {
        let tl::enums::MessageReplies::Replies(replies) = replies;
        replies.replies
    })
}

#[async_trait]
impl SessionBroker for TelegramBroker {
    async fn resolve_entity(
        &self,
        session: &SessionRef,
        handle: &str,
    ) -> Result<EntityDescriptor, ClassifiedError> {
        if looks_like_phone(handle) {
            let phone: String = handle.chars().filter(|c| c.is_ascii_digit()).collect();
            return self
                .run_op(session, move |client| {
                    let phone = phone.clone();
                    Box::pin(async move {
                        let resolved = client
                            .invoke(&tl::functions::contacts::ResolvePhone { phone })
                            .await?;
                        let tl::enums::contacts::ResolvedPeer::Peer(resolved) = resolved;
                        Ok(resolved.users)
                    })
                })
                .await
                .and_then(|users| {
                    users
                        .iter()
                        .find_map(|user| match user {
                            tl::enums::User::User(user) => Some(descriptor_from_tl_user(&user)),
                            _ => None,
                        })
                        .ok_or_else(|| ClassifiedError::new(ErrorKind::UserNotFound))
                });
        }

        if let Some(handle) = normalize_handle(handle) {
            let username = handle.trim_start_matches('@').to_string();
            let chat = self
                .run_op(session, move |client| {
                    let username = username.clone();
                    Box::pin(async move { client.resolve_username(&username).await })
                })
                .await?;
            return match chat {
                Some(chat) => Ok(descriptor_from_chat(&chat)),
                None => Err(ClassifiedError::new(ErrorKind::UserNotFound)),
            };
        }

        // bare numeric ids cannot be dereferenced without an access hash
        Err(ClassifiedError::new(ErrorKind::InvalidIdentifier))
    }

    async fn verify_admin_rights(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        required_permissions: &[String],
    ) -> Result<AdminRights, ClassifiedError> {
        match channel.kind {
            EntityKind::Broadcast | EntityKind::Megagroup => {
                let request = tl::functions::channels::GetParticipant {
                    channel: input_channel(channel),
                    participant: tl::types::InputPeerSelf {}.into(),
                };
                let result = self
                    .run_op(session, move |client| {
                        let request = request.clone();
                        Box::pin(async move { client.invoke(&request).await })
                    })
                    .await;

                let participant = match result {
                    Ok(participant) => participant,
                    // not being a participant is an answer, not a failure
                    Err(e) if e.kind == ErrorKind::GroupRestriction => return Ok(no_rights()),
                    Err(e) => return Err(e),
                };

                let tl::enums::channels::ChannelParticipant::Participant(wrapper) = participant;
                match wrapper.participant {
                    tl::enums::ChannelParticipant::Creator(_) => {
                        let all = ALL_PERMISSIONS.iter().map(|s| s.to_string()).collect();
                        Ok(rights_from_permissions(all, required_permissions))
                    }
                    tl::enums::ChannelParticipant::Admin(admin) => {
                        let tl::enums::ChatAdminRights::Rights(rights) = admin.admin_rights;
                        Ok(rights_from_permissions(
                            admin_rights_permissions(&rights),
                            required_permissions,
                        ))
                    }
                    _ => Ok(no_rights()),
                }
            }
            EntityKind::Group => {
                let me = self
                    .run_op(session, |client| {
                        Box::pin(async move { client.get_me().await })
                    })
                    .await?;
                let my_id = me.id();

                let chat_id = channel.platform_id;
                let full = self
                    .run_op(session, move |client| {
                        Box::pin(async move {
                            client
                                .invoke(&tl::functions::messages::GetFullChat { chat_id })
                                .await
                        })
                    })
                    .await?;

                let tl::enums::messages::ChatFull::Full(full) = full;
                let participants = match full.full_chat {
                    tl::enums::ChatFull::Full(chat_full) => chat_full.participants,
                    _ => return Ok(no_rights()),
                };
                let participants = match participants {
                    tl::enums::ChatParticipants::Participants(list) => list.participants,
                    _ => return Ok(no_rights()),
                };

                for participant in participants {
                    match participant {
                        tl::enums::ChatParticipant::Creator(creator)
                            if creator.user_id == my_id =>
                        {
                            let all = ALL_PERMISSIONS.iter().map(|s| s.to_string()).collect();
                            return Ok(rights_from_permissions(all, required_permissions));
                        }
                        tl::enums::ChatParticipant::Admin(admin) if admin.user_id == my_id => {
                            // small-group admins hold the standard set
                            let granted = vec![
                                "change_info".to_string(),
                                "delete_messages".to_string(),
                                "ban_users".to_string(),
                                "invite_users".to_string(),
                                "pin_messages".to_string(),
                            ];
                            return Ok(rights_from_permissions(granted, required_permissions));
                        }
                        _ => {}
                    }
                }
                Ok(no_rights())
            }
            EntityKind::User | EntityKind::Bot => {
                Err(ClassifiedError::new(ErrorKind::InvalidIdentifier))
            }
        }
    }

    async fn check_comments_enabled(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
    ) -> Result<bool, ClassifiedError> {
        // groups and megagroups are conversational by construction
        if matches!(channel.kind, EntityKind::Group | EntityKind::Megagroup) {
            return Ok(true);
        }

        let packed = packed_from_entity(channel);
        let depth = self.comments_probe_depth;
        let scanned = self
            .run_op(session, move |client| {
                Box::pin(async move {
                    let mut replies = Vec::with_capacity(depth);
                    let mut iter = client.iter_messages(packed).limit(depth);
                    while let Some(message) = iter.next().await? {
                        replies.push(message_reply_count(&message).unwrap_or(0));
                    }
                    Ok(replies)
                })
            })
            .await;

        match scanned {
            Ok(replies) => Ok(replies.iter().any(|count| *count > 0)),
            Err(e) => {
                warn!(
                    "Comment probe failed for {} ({}), treating as disabled",
                    channel.title, e
                );
                Ok(false)
            }
        }
    }

    async fn fetch_history(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        profile: SpeedProfile,
        offset_id: Option<i32>,
    ) -> Result<HistoryBatch, ClassifiedError> {
        let packed = packed_from_entity(channel);
        let batch_size = profile.settings().batch_size;

        self.run_op(session, move |client| {
            Box::pin(async move {
                let mut items = Vec::with_capacity(batch_size);
                let mut iter = client.iter_messages(packed).limit(batch_size);
                if let Some(offset) = offset_id {
                    iter = iter.offset_id(offset);
                }
                while let Some(message) = iter.next().await? {
                    items.push(HistoryMessage {
                        id: message.id(),
                        date: message.date(),
                        text: message.text().to_string(),
                        media_kind: message.media().as_ref().map(media_kind_name).map(String::from),
                        media_bytes: None,
                        reply_count: message_reply_count(&message),
                    });
                    if items.len() >= batch_size {
                        break;
                    }
                }
                let next_offset = if items.len() >= batch_size {
                    items.last().map(|item| item.id)
                } else {
                    None
                };
                Ok(HistoryBatch { items, next_offset })
            })
        })
        .await
    }

    async fn fetch_participants(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        profile: SpeedProfile,
        offset: usize,
    ) -> Result<ParticipantBatch, ClassifiedError> {
        let batch_size = profile.settings().batch_size;

        let users = match channel.kind {
            EntityKind::Broadcast | EntityKind::Megagroup => {
                let request = tl::functions::channels::GetParticipants {
                    channel: input_channel(channel),
                    filter: tl::types::ChannelParticipantsRecent {}.into(),
                    offset: offset as i32,
                    limit: batch_size as i32,
                    hash: 0,
                };
                let response = self
                    .run_op(session, move |client| {
                        let request = request.clone();
                        Box::pin(async move { client.invoke(&request).await })
                    })
                    .await?;
                match response {
                    tl::enums::channels::ChannelParticipants::ChannelParticipants(list) => {
                        list.users
                    }
                    _ => Vec::new(),
                }
            }
            EntityKind::Group => {
                let chat_id = channel.platform_id;
                let full = self
                    .run_op(session, move |client| {
                        Box::pin(async move {
                            client
                                .invoke(&tl::functions::messages::GetFullChat { chat_id })
                                .await
                        })
                    })
                    .await?;
                let tl::enums::messages::ChatFull::ChatFull(full) = full;
                // small groups return the full membership at once
                if offset > 0 {
                    Vec::new()
                } else {
                    full.users
                }
            }
            EntityKind::User | EntityKind::Bot => {
                return Err(ClassifiedError::new(ErrorKind::InvalidIdentifier))
            }
        };

        let items: Vec<ParticipantInfo> = users
            .iter()
            .filter_map(|user| match user {
                tl::enums::User::User(user) => Some(ParticipantInfo {
                    user_id: user.id,
                    username: user.username.clone(),
                    first_name: user.first_name.clone(),
                    last_name: user.last_name.clone(),
                    phone: user.phone.clone(),
                    is_bot: user.bot,
                }),
                _ => None,
            })
            .collect();

        let next_offset = if items.len() >= batch_size {
            Some(offset + items.len())
        } else {
            None
        };
        Ok(ParticipantBatch { items, next_offset })
    }

    async fn send_invite(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        target: &TargetIdentity,
    ) -> Result<(), ClassifiedError> {
        let input_user = self.resolve_input_user(session, target).await?;

        match channel.kind {
            EntityKind::Broadcast | EntityKind::Megagroup => {
                let request = tl::functions::channels::InviteToChannel {
                    channel: input_channel(channel),
                    users: vec![input_user.into()],
                };
                self.run_op(session, move |client| {
                    let request = request.clone();
                    Box::pin(async move {
                        client.invoke(&request).await?;
                        Ok(())
                    })
                })
                .await
            }
            EntityKind::Group => {
                let request = tl::functions::messages::AddChatUser {
                    chat_id: channel.platform_id,
                    user_id: input_user.into(),
                    fwd_limit: 0,
                };
                self.run_op(session, move |client| {
                    let request = request.clone();
                    Box::pin(async move {
                        client.invoke(&request).await?;
                        Ok(())
                    })
                })
                .await
            }
            EntityKind::User | EntityKind::Bot => {
                Err(ClassifiedError::new(ErrorKind::GroupRestriction))
            }
        }
    }

    async fn send_direct_message(
        &self,
        session: &SessionRef,
        target: &TargetIdentity,
        text: &str,
    ) -> Result<(), ClassifiedError> {
        let input_user = self.resolve_input_user(session, target).await?;
        let packed = PackedChat {
            ty: PackedType::User,
            id: input_user.user_id,
            access_hash: Some(input_user.access_hash),
        };
        let text = text.to_string();

        self.run_op(session, move |client| {
            let text = text.clone();
            Box::pin(async move {
                client.send_message(packed, text).await?;
                Ok(())
            })
        })
        .await
    }

    async fn probe_session(&self, session: &SessionRef) -> Result<(), ClassifiedError> {
        self.run_op(session, |client| {
            Box::pin(async move {
                client.get_me().await?;
                Ok(())
            })
        })
        .await
    }

    async fn disconnect(&self, session_id: &str) {
        self.registry.remove(session_id).await;
    }
}
