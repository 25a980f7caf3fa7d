use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use duty_core::{
    Clock, ConfigSnapshot, DirectoryEntry, InboundEvent, InboundMessage, Keywords, OutboundReply,
    Roster, Session, SessionError, SharedConfig, Transport,
};
use time::{OffsetDateTime, macros::datetime};
use tokio::sync::mpsc;

type SendHook = Box<dyn Fn() + Send + Sync>;

/// In-memory transport: replays a fixed event list, then closes the stream.
#[derive(Default)]
struct FakeTransport {
    events: Mutex<Vec<InboundEvent>>,
    users: Vec<DirectoryEntry>,
    users_fail: bool,
    send_fails: bool,
    sent: Mutex<Vec<OutboundReply>>,
    user_queries: AtomicUsize,
    disconnected: AtomicBool,
    on_send: Option<SendHook>,
}

impl FakeTransport {
    fn new(events: Vec<InboundEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            users: vec![
                DirectoryEntry {
                    username: "alice".to_owned(),
                    user_id: "U1".to_owned(),
                    is_local: true,
                },
                DirectoryEntry {
                    username: "bob".to_owned(),
                    user_id: "U2".to_owned(),
                    is_local: true,
                },
            ],
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<OutboundReply> {
        self.sent.lock().unwrap().clone()
    }

    fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<InboundEvent>> {
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn users(&self, _channel_id: &str) -> Result<Vec<DirectoryEntry>> {
        self.user_queries.fetch_add(1, Ordering::SeqCst);
        if self.users_fail {
            return Err(anyhow!("directory unavailable"));
        }
        Ok(self.users.clone())
    }

    async fn send(&self, reply: &OutboundReply) -> Result<()> {
        if let Some(hook) = &self.on_send {
            hook();
        }
        if self.send_fails {
            return Err(anyhow!("send rejected"));
        }
        self.sent.lock().unwrap().push(reply.clone());
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

struct FixedClock(OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

// 2024-01-07 is a Sunday.
const SUNDAY: OffsetDateTime = datetime!(2024-01-07 10:00 UTC);
const TUESDAY: OffsetDateTime = datetime!(2024-01-09 10:00 UTC);

fn roster() -> Roster {
    let mut days = vec![Vec::new(); 7];
    days[0] = vec!["alice".to_owned()];
    days[1] = vec!["bob".to_owned()];
    Roster::new(days).unwrap()
}

fn snapshot() -> ConfigSnapshot {
    let mut snapshot = ConfigSnapshot::new("token", Keywords::new(["standup"]));
    snapshot.roster = roster();
    snapshot
}

fn message(text: &str) -> InboundEvent {
    InboundEvent::Message(InboundMessage {
        text: Some(text.to_owned()),
        channel_id: "!room:example.org".to_owned(),
        message_id: "$msg".to_owned(),
        thread_id: None,
        is_topic_change: false,
    })
}

fn transport_errors(n: usize) -> Vec<InboundEvent> {
    (0..n)
        .map(|i| InboundEvent::TransportError {
            detail: format!("socket dropped #{i}"),
        })
        .collect()
}

async fn run(
    transport: &Arc<FakeTransport>,
    config: SharedConfig,
    now: OffsetDateTime,
) -> Result<(), SessionError> {
    Session::new(Arc::clone(transport), config, Arc::new(FixedClock(now)))
        .run()
        .await
}

#[tokio::test]
async fn replies_with_todays_duty() {
    let transport = Arc::new(FakeTransport::new(vec![
        InboundEvent::ConnectionEstablished,
        message("standup please"),
    ]));
    run(&transport, SharedConfig::new(snapshot()), SUNDAY)
        .await
        .unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "@alice");
    assert!(sent[0].html.contains("U1"));
    assert!(!sent[0].html.contains("U2"));
    assert_eq!(sent[0].mentioned_user_ids, ["U1"]);
    assert_eq!(sent[0].thread_anchor.as_deref(), Some("$msg"));
    assert_eq!(sent[0].reply_to, "$msg");
    assert!(!transport.disconnected());
}

#[tokio::test]
async fn remote_namesake_does_not_take_the_duty_ping() {
    let mut fake = FakeTransport::new(vec![message("standup please")]);
    fake.users = vec![
        DirectoryEntry {
            username: "alice".to_owned(),
            user_id: "@alice:example.org".to_owned(),
            is_local: true,
        },
        DirectoryEntry {
            username: "alice".to_owned(),
            user_id: "@alice:evil.org".to_owned(),
            is_local: false,
        },
    ];
    let transport = Arc::new(fake);
    run(&transport, SharedConfig::new(snapshot()), SUNDAY)
        .await
        .unwrap();

    assert_eq!(transport.sent()[0].mentioned_user_ids, ["@alice:example.org"]);
}

#[tokio::test]
async fn ignores_messages_without_keywords() {
    let transport = Arc::new(FakeTransport::new(vec![
        message("good morning"),
        message(""),
        InboundEvent::Message(InboundMessage {
            text: Some("standup topic".to_owned()),
            is_topic_change: true,
            ..InboundMessage::default()
        }),
    ]));
    run(&transport, SharedConfig::new(snapshot()), SUNDAY)
        .await
        .unwrap();

    assert!(transport.sent().is_empty());
    assert_eq!(transport.user_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_day_without_fallback_sends_nothing() {
    let transport = Arc::new(FakeTransport::new(vec![message("standup please")]));
    run(&transport, SharedConfig::new(snapshot()), TUESDAY)
        .await
        .unwrap();

    assert!(transport.sent().is_empty());
    assert!(!transport.disconnected());
}

#[tokio::test]
async fn empty_day_with_fallback_mentions_group() {
    let mut config = snapshot();
    config.fallback_group_id = Some("G1".to_owned());
    config.fallback_group_name = Some("oncall".to_owned());
    let transport = Arc::new(FakeTransport::new(vec![message("standup please")]));
    run(&transport, SharedConfig::new(config), TUESDAY)
        .await
        .unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "@oncall");
    assert!(sent[0].html.contains("G1"));
    assert!(sent[0].mentioned_user_ids.is_empty());
}

#[tokio::test]
async fn directory_failure_is_not_fatal() {
    let mut fake = FakeTransport::new(vec![message("standup"), message("standup again")]);
    fake.users_fail = true;
    let transport = Arc::new(fake);
    run(&transport, SharedConfig::new(snapshot()), SUNDAY)
        .await
        .unwrap();

    assert!(transport.sent().is_empty());
    assert_eq!(transport.user_queries.load(Ordering::SeqCst), 2);
    assert!(!transport.disconnected());
}

#[tokio::test]
async fn send_failure_does_not_stop_session() {
    let mut fake = FakeTransport::new(vec![
        message("standup"),
        InboundEvent::ConnectionEstablished,
        message("standup"),
    ]);
    fake.send_fails = true;
    let transport = Arc::new(fake);
    run(&transport, SharedConfig::new(snapshot()), SUNDAY)
        .await
        .unwrap();

    assert_eq!(transport.user_queries.load(Ordering::SeqCst), 2);
    assert!(!transport.disconnected());
}

#[tokio::test]
async fn unthreaded_reply_when_threads_disabled() {
    let mut config = snapshot();
    config.reply_in_thread = false;
    let transport = Arc::new(FakeTransport::new(vec![message("standup")]));
    run(&transport, SharedConfig::new(config), SUNDAY)
        .await
        .unwrap();

    assert_eq!(transport.sent()[0].thread_anchor, None);
}

#[tokio::test]
async fn authentication_failure_disconnects_and_terminates() {
    let transport = Arc::new(FakeTransport::new(vec![
        InboundEvent::AuthenticationFailed,
        message("standup"),
    ]));
    let result = run(&transport, SharedConfig::new(snapshot()), SUNDAY).await;

    assert!(matches!(result, Err(SessionError::AuthenticationFailed)));
    assert!(transport.disconnected());
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn survives_errors_just_below_threshold() {
    let transport = Arc::new(FakeTransport::new(transport_errors(499)));
    let result = run(&transport, SharedConfig::new(snapshot()), SUNDAY).await;

    assert!(result.is_ok());
    assert!(!transport.disconnected());
}

#[tokio::test]
async fn terminates_at_default_threshold() {
    let transport = Arc::new(FakeTransport::new(transport_errors(500)));
    let result = run(&transport, SharedConfig::new(snapshot()), SUNDAY).await;

    match result {
        Err(SessionError::ErrorBudgetExhausted { threshold, detail }) => {
            assert_eq!(threshold, 500);
            assert_eq!(detail, "socket dropped #499");
        }
        other => panic!("expected budget exhaustion, got {other:?}"),
    }
    assert!(transport.disconnected());
}

#[tokio::test]
async fn healthy_events_reset_the_budget() {
    let mut events = transport_errors(2);
    events.push(InboundEvent::ConnectionEstablished);
    events.extend(transport_errors(2));
    events.push(message("unrelated chatter"));
    events.extend(transport_errors(2));

    let mut config = snapshot();
    config.error_retry_threshold = 3;
    let transport = Arc::new(FakeTransport::new(events));
    let result = run(&transport, SharedConfig::new(config), SUNDAY).await;

    assert!(result.is_ok());
    assert!(!transport.disconnected());
}

#[tokio::test]
async fn classification_uses_latest_snapshot() {
    let config = SharedConfig::new(snapshot());
    let writer = config.clone();
    let mut fake = FakeTransport::new(vec![message("standup"), message("deploy time")]);
    fake.on_send = Some(Box::new(move || {
        let mut next = snapshot();
        next.keywords = Keywords::new(["deploy"]);
        writer.replace(next);
    }));
    let transport = Arc::new(fake);
    run(&transport, config, SUNDAY).await.unwrap();

    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test]
async fn utc_offset_shifts_the_roster_day() {
    // Saturday 23:30 UTC is already Sunday at UTC+1.
    let mut config = snapshot();
    config.utc_offset = time::UtcOffset::from_hms(1, 0, 0).unwrap();
    let transport = Arc::new(FakeTransport::new(vec![message("standup")]));
    run(
        &transport,
        SharedConfig::new(config),
        datetime!(2024-01-06 23:30 UTC),
    )
    .await
    .unwrap();

    assert_eq!(transport.sent()[0].text, "@alice");
}

#[tokio::test]
async fn connect_failure_is_fatal() {
    struct Broken;

    #[async_trait]
    impl Transport for Broken {
        async fn connect(&self) -> Result<mpsc::Receiver<InboundEvent>> {
            Err(anyhow!("no route to host"))
        }
        async fn users(&self, _channel_id: &str) -> Result<Vec<DirectoryEntry>> {
            Ok(Vec::new())
        }
        async fn send(&self, _reply: &OutboundReply) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
    }

    let result = Session::new(
        Arc::new(Broken),
        SharedConfig::new(snapshot()),
        Arc::new(FixedClock(SUNDAY)),
    )
    .run()
    .await;
    assert!(matches!(result, Err(SessionError::Connect(_))));
}
