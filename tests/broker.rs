mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use streamvisor::{
    BrokerConfig, BrokerConnection, Bus, CommandDispatcher, ConnectionState, ControlTarget, Event,
    EventKind, MemoryTransport, Page,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use common::{eventually, WAIT};

struct Idle;

#[async_trait]
impl ControlTarget for Idle {
    async fn restart(&self) -> bool {
        false
    }

    fn page(&self) -> Option<Arc<dyn Page>> {
        None
    }
}

struct Running {
    conn: Arc<BrokerConnection>,
    events: broadcast::Receiver<Event>,
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_connection(transport: &MemoryTransport, cfg: &BrokerConfig) -> Running {
    let bus = Bus::new(256);
    let events = bus.subscribe();
    let conn = Arc::new(BrokerConnection::new(Arc::new(transport.clone()), cfg, bus));
    let dispatcher = Arc::new(CommandDispatcher::new("bot", Arc::new(Idle), None));
    let token = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&conn).run(dispatcher, token.clone()));
    Running {
        conn,
        events,
        token,
        task,
    }
}

/// Next event of `kind`, without a wall-clock bound (safe under paused time).
async fn next_kind(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    loop {
        match rx.recv().await {
            Ok(ev) if ev.kind == kind => return ev,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_then_reset_the_counter() {
    let transport = MemoryTransport::new();
    transport.answer_probes("streamer.ping").await.unwrap();
    transport.fail_next_connects(3);

    let cfg = BrokerConfig {
        heartbeat_secs: 0,
        ..BrokerConfig::default()
    };
    let mut r = spawn_connection(&transport, &cfg);

    let mut schedule = Vec::new();
    for _ in 0..3 {
        let ev = next_kind(&mut r.events, EventKind::ReconnectScheduled).await;
        schedule.push((ev.attempt, ev.delay_ms));
    }
    assert_eq!(
        schedule,
        vec![
            (Some(1), Some(2_000)),
            (Some(2), Some(4_000)),
            (Some(3), Some(8_000)),
        ]
    );

    next_kind(&mut r.events, EventKind::BrokerConnected).await;
    assert_eq!(r.conn.retry_count(), 0);
    assert_eq!(r.conn.state(), ConnectionState::Connected);
    assert_eq!(transport.connect_count(), 1);

    r.token.cancel();
    r.task.await.unwrap();
    assert_eq!(r.conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn lost_session_reconnects_and_announces_again() {
    let transport = MemoryTransport::new();
    transport.answer_probes("streamer.ping").await.unwrap();
    let mut announcements = transport.peer().subscribe("streamer.connected").await.unwrap();

    let mut cfg = BrokerConfig {
        heartbeat_secs: 0,
        ..BrokerConfig::default()
    };
    cfg.backoff.first = Duration::from_millis(10);
    let mut r = spawn_connection(&transport, &cfg);

    let first = tokio::time::timeout(WAIT, announcements.recv()).await.unwrap().unwrap();
    assert_eq!(first.origin.as_deref(), Some(r.conn.tag()));

    transport.sever().await;
    let lost = next_kind(&mut r.events, EventKind::BrokerDisconnected).await;
    assert!(lost.reason.as_deref().unwrap_or_default().contains("closed"));
    let scheduled = next_kind(&mut r.events, EventKind::ReconnectScheduled).await;
    assert_eq!(scheduled.attempt, Some(1));

    tokio::time::timeout(WAIT, announcements.recv()).await.unwrap().unwrap();
    let conn = Arc::clone(&r.conn);
    eventually(move || conn.state() == ConnectionState::Connected && conn.retry_count() == 0).await;
    assert_eq!(transport.connect_count(), 2);

    r.token.cancel();
    r.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeat_is_reported() {
    let transport = MemoryTransport::new();
    let responder = transport.answer_probes("streamer.ping").await.unwrap();

    let cfg = BrokerConfig {
        heartbeat_secs: 30,
        ..BrokerConfig::default()
    };
    let mut r = spawn_connection(&transport, &cfg);
    next_kind(&mut r.events, EventKind::BrokerConnected).await;

    responder.abort();
    let missed = next_kind(&mut r.events, EventKind::HeartbeatMissed).await;
    assert_eq!(missed.topic.as_deref(), Some("streamer.ping"));
    assert_eq!(r.conn.state(), ConnectionState::Connected);

    r.token.cancel();
    r.task.await.unwrap();
}

#[tokio::test]
async fn publish_while_disconnected_is_dropped_with_an_id() {
    let transport = MemoryTransport::new();
    let conn = BrokerConnection::new(Arc::new(transport), &BrokerConfig::default(), Bus::new(8));

    let id = conn.publish("streamer.status", None).await;
    assert!(id.starts_with("streamer.status."));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}
