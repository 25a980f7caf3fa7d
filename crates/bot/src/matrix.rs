use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use duty_core::{DirectoryEntry, InboundEvent, InboundMessage, OutboundReply, Transport, truncate};
use matrix_sdk::{
    Client, LoopCtrl, RoomMemberships, SessionMeta,
    authentication::{SessionTokens, matrix::MatrixSession},
    config::SyncSettings,
    room::Room,
    ruma::{
        EventId, MilliSecondsSinceUnixEpoch, RoomId, ServerName, UserId,
        api::client::error::ErrorKind,
        events::{
            Mentions,
            relation::Thread,
            room::{
                member::{MembershipState, StrippedRoomMemberEvent},
                message::{
                    MessageType, OriginalSyncRoomMessageEvent, Relation, RoomMessageEventContent,
                },
                topic::OriginalSyncRoomTopicEvent,
            },
        },
    },
    sync::SyncResponse,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

/// Log in with a pre-issued access token.
pub async fn restore_session(
    client: &Client,
    user_id: &str,
    device_id: &str,
    access_token: String,
) -> Result<()> {
    info!("Restoring session for {user_id}");
    let session = MatrixSession {
        meta: SessionMeta {
            user_id: user_id.parse().context("invalid user_id")?,
            device_id: device_id.to_owned().into(),
        },
        tokens: SessionTokens {
            access_token,
            refresh_token: None,
        },
    };
    client
        .restore_session(session)
        .await
        .context("restoring session")
}

/// [`Transport`] over a Matrix homeserver. Rooms are channels, event ids
/// are message ids, the room's joined members are the user directory.
#[derive(Debug)]
pub struct MatrixTransport {
    client: Client,
    sync_timeout: Duration,
    autojoin: bool,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl MatrixTransport {
    pub fn new(client: Client, sync_timeout: Duration, autojoin: bool) -> Self {
        Self {
            client,
            sync_timeout,
            autojoin,
            sync_task: Mutex::new(None),
        }
    }

    fn room(&self, channel_id: &str) -> Result<Room> {
        let room_id =
            RoomId::parse(channel_id).with_context(|| format!("invalid room id {channel_id}"))?;
        self.client
            .get_room(&room_id)
            .ok_or_else(|| anyhow!("not a member of room {channel_id}"))
    }
}

#[async_trait]
impl Transport for MatrixTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<InboundEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        // Anything older is backlog from the initial sync.
        let since = MilliSecondsSinceUnixEpoch::now();

        if self.autojoin {
            add_autojoin_handler(&self.client);
        }
        add_message_handler(&self.client, tx.clone(), since);
        add_topic_handler(&self.client, tx.clone(), since);

        let settings = SyncSettings::default().timeout(self.sync_timeout);
        let handle = tokio::spawn(sync_loop(self.client.clone(), settings, tx));
        if let Some(previous) = self.sync_task.lock().await.replace(handle) {
            previous.abort();
        }
        info!("Starting sync loop");
        Ok(rx)
    }

    async fn users(&self, channel_id: &str) -> Result<Vec<DirectoryEntry>> {
        let room = self.room(channel_id)?;
        let members = room
            .members(RoomMemberships::JOIN)
            .await
            .context("listing room members")?;
        let own_server = self.client.user_id().map(UserId::server_name);
        Ok(members
            .iter()
            .map(|member| directory_entry(member.user_id(), own_server))
            .collect())
    }

    async fn send(&self, reply: &OutboundReply) -> Result<()> {
        let room = self.room(&reply.channel_id)?;
        let mut content = RoomMessageEventContent::text_html(reply.text.clone(), reply.html.clone());
        content.mentions = Some(Mentions::with_user_ids(
            reply
                .mentioned_user_ids
                .iter()
                .filter_map(|id| UserId::parse(id.as_str()).ok()),
        ));
        if let Some(anchor) = &reply.thread_anchor {
            let root = EventId::parse(anchor.as_str())
                .with_context(|| format!("invalid thread root {anchor}"))?;
            let latest = EventId::parse(reply.reply_to.as_str())
                .with_context(|| format!("invalid event id {}", reply.reply_to))?;
            content.relates_to = Some(Relation::Thread(Thread::plain(root, latest)));
        }
        room.send(content).await.context("sending reply")?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.sync_task.lock().await.take() {
            handle.abort();
            info!("Sync loop stopped");
        }
    }
}

fn add_autojoin_handler(client: &Client) {
    client.add_event_handler(
        async move |ev: StrippedRoomMemberEvent, room: Room, client: Client| {
            if ev.content.membership != MembershipState::Invite {
                return;
            }
            let Some(own_id) = client.user_id() else {
                return;
            };
            if ev.state_key != own_id.as_str() {
                return;
            }
            info!(room_id = %room.room_id(), "Auto-joining invited room");
            if let Err(e) = room.join().await {
                warn!(error = %e, "Failed to accept invite");
            }
        },
    );
}

fn add_message_handler(
    client: &Client,
    tx: mpsc::Sender<InboundEvent>,
    since: MilliSecondsSinceUnixEpoch,
) {
    client.add_event_handler(
        move |ev: OriginalSyncRoomMessageEvent, room: Room, client: Client| {
            let tx = tx.clone();
            async move {
                let Some(message) = inbound_message(&ev, room.room_id(), client.user_id(), since)
                else {
                    return;
                };
                debug!(
                    room_id = %message.channel_id,
                    sender = %ev.sender,
                    body = ?message.text.as_deref().map(|t| truncate(t, 200)),
                    "Incoming room message"
                );
                if tx.send(InboundEvent::Message(message)).await.is_err() {
                    debug!("Session gone, dropping message");
                }
            }
        },
    );
}

fn add_topic_handler(
    client: &Client,
    tx: mpsc::Sender<InboundEvent>,
    since: MilliSecondsSinceUnixEpoch,
) {
    client.add_event_handler(move |ev: OriginalSyncRoomTopicEvent, room: Room| {
        let tx = tx.clone();
        async move {
            let Some(message) = inbound_topic(&ev, room.room_id(), since) else {
                return;
            };
            if tx.send(InboundEvent::Message(message)).await.is_err() {
                debug!("Session gone, dropping topic change");
            }
        }
    });
}

/// Map a room message to what the session sees.
///
/// `None` for backlog from before `since`, the bot's own messages and edits.
/// Edits repeat the original body and must not trigger a second reply.
fn inbound_message(
    ev: &OriginalSyncRoomMessageEvent,
    room_id: &RoomId,
    own_user: Option<&UserId>,
    since: MilliSecondsSinceUnixEpoch,
) -> Option<InboundMessage> {
    if ev.origin_server_ts < since || own_user.is_some_and(|own| ev.sender == own) {
        return None;
    }
    if matches!(ev.content.relates_to, Some(Relation::Replacement(_))) {
        return None;
    }

    let text = match &ev.content.msgtype {
        MessageType::Text(t) => Some(t.body.clone()),
        MessageType::Notice(n) => Some(n.body.clone()),
        MessageType::Emote(e) => Some(e.body.clone()),
        _ => None,
    };
    let thread_id = if let Some(Relation::Thread(thread)) = &ev.content.relates_to {
        Some(thread.event_id.to_string())
    } else {
        None
    };

    Some(InboundMessage {
        text,
        channel_id: room_id.to_string(),
        message_id: ev.event_id.to_string(),
        thread_id,
        is_topic_change: false,
    })
}

fn inbound_topic(
    ev: &OriginalSyncRoomTopicEvent,
    room_id: &RoomId,
    since: MilliSecondsSinceUnixEpoch,
) -> Option<InboundMessage> {
    (ev.origin_server_ts >= since).then(|| InboundMessage {
        text: Some(ev.content.topic.clone()),
        channel_id: room_id.to_string(),
        message_id: ev.event_id.to_string(),
        thread_id: None,
        is_topic_change: true,
    })
}

/// Members are known by localpart; only those on the bot's server are local.
fn directory_entry(user_id: &UserId, own_server: Option<&ServerName>) -> DirectoryEntry {
    DirectoryEntry {
        username: user_id.localpart().to_owned(),
        user_id: user_id.to_string(),
        is_local: own_server.is_some_and(|server| user_id.server_name() == server),
    }
}

/// Sync until the token is rejected or the session stops listening.
///
/// The first good response after start or after a failure is reported as
/// [`InboundEvent::ConnectionEstablished`].
async fn sync_loop(client: Client, settings: SyncSettings, tx: mpsc::Sender<InboundEvent>) {
    let online = Arc::new(AtomicBool::new(false));
    let result = client
        .sync_with_result_callback(settings, |response: matrix_sdk::Result<SyncResponse>| {
            let tx = tx.clone();
            let online = Arc::clone(&online);
            async move {
                let event = match response {
                    Ok(_) => {
                        if online.swap(true, Ordering::SeqCst) {
                            return Ok(LoopCtrl::Continue);
                        }
                        InboundEvent::ConnectionEstablished
                    }
                    Err(e) => {
                        online.store(false, Ordering::SeqCst);
                        if is_auth_failure(&e) {
                            InboundEvent::AuthenticationFailed
                        } else {
                            InboundEvent::TransportError {
                                detail: e.to_string(),
                            }
                        }
                    }
                };
                let fatal = matches!(event, InboundEvent::AuthenticationFailed);
                if tx.send(event).await.is_err() || fatal {
                    return Ok(LoopCtrl::Break);
                }
                Ok(LoopCtrl::Continue)
            }
        })
        .await;

    if let Err(e) = result {
        let detail = format!("sync loop stopped: {e}");
        let _ = tx.send(InboundEvent::TransportError { detail }).await;
    }
}

fn is_auth_failure(error: &matrix_sdk::Error) -> bool {
    is_auth_failure_kind(error.client_api_error_kind())
}

fn is_auth_failure_kind(kind: Option<&ErrorKind>) -> bool {
    matches!(
        kind,
        Some(ErrorKind::UnknownToken { .. } | ErrorKind::MissingToken { .. })
    )
}
