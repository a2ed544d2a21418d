//! Push channel state machine, event merges and polling fallback

mod common;

use common::{calls, counting, settle, MockTransport};
use serde_json::{json, Value};
use std::time::Duration;
use swrcache::channel::{ClientEvent, ConnectionState, Notification, PushEvent};
use swrcache::{ChannelError, HookOptions, SwrClient};

const METRICS: &str = "admin:metrics";
const SESSIONS: &str = "admin:sessions";

fn event(frame: Value) -> PushEvent {
  serde_json::from_value(frame).unwrap()
}

fn initial_data() -> PushEvent {
  event(json!({
    "event": "initialData",
    "data": {
      "health": {"services": {"db": {"status": "up"}, "cache": {"status": "up"}}},
      "metrics": {
        "cpu": {"usage": 10},
        "memory": {"usagePercent": 50},
        "application": {"uptime": 100},
        "disk": {"free": 5}
      }
    }
  }))
}

fn cached(client: &SwrClient, key: &str) -> Option<Value> {
  client.store().get(key).and_then(|entry| entry.data)
}

// =============================================================================
// Event Merges
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_quick_metrics_merges_into_current_value() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();

  channel.apply(initial_data());
  channel.apply(event(json!({
    "event": "quickMetrics",
    "data": {"cpu": 20, "memory": 60, "uptime": 110}
  })));

  let data = cached(&client, METRICS).unwrap();
  assert_eq!(
    data["metrics"],
    json!({
      "cpu": {"usage": 20},
      "memory": {"usagePercent": 60},
      "application": {"uptime": 110},
      "disk": {"free": 5}
    })
  );
  assert_eq!(data["health"]["services"]["db"]["status"], "up");
}

#[tokio::test(start_paused = true)]
async fn test_quick_metrics_without_cached_value_is_ignored() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();

  channel.apply(event(json!({
    "event": "quickMetrics",
    "data": {"cpu": 20, "memory": 60, "uptime": 110}
  })));
  assert!(cached(&client, METRICS).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_service_alert_flips_known_service_only() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();
  let mut notes = channel.notifications();
  channel.apply(initial_data());

  channel.apply(event(json!({
    "event": "serviceAlert",
    "data": {"service": "db", "status": "down", "timestamp": "2026-10-14T08:00:00Z"}
  })));
  let data = cached(&client, METRICS).unwrap();
  assert_eq!(data["health"]["services"]["db"]["status"], "down");
  assert_eq!(data["health"]["services"]["cache"]["status"], "up");

  channel.apply(event(json!({
    "event": "serviceAlert",
    "data": {"service": "search", "status": "down", "timestamp": 1792224000000i64}
  })));
  assert_eq!(cached(&client, METRICS).unwrap(), data);

  // both alerts still reach the user
  for service in ["db", "search"] {
    match notes.recv().await.unwrap() {
      Notification::ServiceAlert(alert) => assert_eq!(alert.service, service),
      other => panic!("unexpected notification: {:?}", other),
    }
  }
}

#[tokio::test(start_paused = true)]
async fn test_metrics_update_replaces_snapshot() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();
  channel.apply(initial_data());

  channel.apply(event(json!({
    "event": "metricsUpdate",
    "data": {
      "health": {"services": {"db": {"status": "up"}}},
      "metrics": {"cpu": {"usage": 77}},
      "timestamp": "2026-10-14T08:00:00Z"
    }
  })));
  let data = cached(&client, METRICS).unwrap();
  assert_eq!(data["metrics"], json!({"cpu": {"usage": 77}}));
  assert!(data["health"]["services"].get("cache").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_side_effect_events_only_notify() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();
  let mut notes = channel.notifications();

  channel.apply(event(json!({
    "event": "backupProgress",
    "data": {"status": "failed", "message": "disk full"}
  })));
  channel.apply(event(json!({
    "event": "bulkOperationProgress",
    "data": {"type": "delete", "completed": 5, "total": 10}
  })));
  channel.apply(event(json!({"event": "error", "data": {"message": "rate limited"}})));

  assert!(matches!(notes.recv().await, Ok(Notification::Backup(_))));
  match notes.recv().await.unwrap() {
    Notification::BulkProgress(progress) => assert_eq!(progress.percent(), 50.0),
    other => panic!("unexpected notification: {:?}", other),
  }
  assert_eq!(
    notes.recv().await.unwrap(),
    Notification::ServerError("rate limited".into())
  );
  assert_eq!(
    channel.last_error(),
    Some(ChannelError::Server("rate limited".into()))
  );
  assert!(cached(&client, METRICS).is_none());
}

// =============================================================================
// Connection Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_requests_initial_data() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let mut remote = mock.accept_next();
  let channel = client.push_channel(mock.clone()).build();

  let mut socket = client.use_metrics_socket(&channel);
  settle().await;
  assert!(socket.is_connected());
  assert_eq!(remote.commands.recv().await, Some(ClientEvent::RequestInitialData));

  remote.push(initial_data());
  remote.push(event(json!({
    "event": "sessionUpdate",
    "data": {"stats": {"active": 2}, "action": "terminated"}
  })));
  settle().await;
  assert!(socket.changed().await);

  let snapshot = socket.metrics().unwrap();
  assert_eq!(snapshot.health.services["db"].status, "up");
  assert_eq!(socket.sessions(), Some(json!({"active": 2})));
  assert_eq!(cached(&client, SESSIONS), Some(json!({"active": 2})));

  socket.refresh_metrics().await.unwrap();
  socket.refresh_sessions().unwrap();
  assert_eq!(remote.commands.recv().await, Some(ClientEvent::RefreshMetrics));
  assert_eq!(remote.commands.recv().await, Some(ClientEvent::RefreshSessions));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_keeps_connection() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let remote = mock.accept_next();
  let channel = client.push_channel(mock.clone()).build();
  let _lease = channel.attach();
  settle().await;

  remote
    .events
    .send(Err(ChannelError::Protocol("unexpected token".into())))
    .unwrap();
  remote.push(initial_data());
  settle().await;
  assert_eq!(channel.state(), ConnectionState::Connected);
  assert!(cached(&client, METRICS).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_emit_without_connection_fails() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();
  assert_eq!(
    channel.emit(ClientEvent::RefreshMetrics),
    Err(ChannelError::Closed)
  );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_doubles_up_to_cap() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let options = HookOptions {
    fallback_to_polling: false,
    ..HookOptions::default()
  };
  let channel = client.push_channel(mock.clone()).options(options).build();
  let _lease = channel.attach();

  settle().await;
  assert_eq!(mock.attempts(), 1);
  assert_eq!(channel.state(), ConnectionState::Error);
  assert!(matches!(channel.last_error(), Some(ChannelError::Connect(_))));
  assert!(!channel.is_polling());

  // retries at 1s, 3s, 7s
  tokio::time::sleep(Duration::from_millis(7_500)).await;
  assert_eq!(mock.attempts(), 4);

  // then 15s, 31s, and capped at 30s apart from there
  tokio::time::sleep(Duration::from_millis(54_000)).await;
  assert_eq!(mock.attempts(), 7);
  tokio::time::sleep(Duration::from_millis(30_000)).await;
  assert_eq!(mock.attempts(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_last_lease_disconnects() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let mut remote = mock.accept_next();
  let channel = client.push_channel(mock.clone()).build();

  let a = client.use_metrics_socket(&channel);
  let b = client.use_metrics_socket(&channel);
  settle().await;
  assert_eq!(channel.lease_count(), 2);
  assert_eq!(mock.attempts(), 1);

  drop(a);
  settle().await;
  assert!(b.is_connected());

  drop(b);
  assert_eq!(channel.lease_count(), 0);
  assert_eq!(channel.state(), ConnectionState::Disconnected);
  assert_eq!(remote.commands.recv().await, Some(ClientEvent::RequestInitialData));
  assert_eq!(remote.commands.recv().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_churn_keeps_loop_for_remaining_holders() {
  let client = SwrClient::default();
  let channel = client.push_channel(MockTransport::new()).build();

  let workers: Vec<_> = (0..4)
    .map(|_| {
      let channel = channel.clone();
      tokio::spawn(async move {
        for _ in 0..200 {
          drop(channel.attach());
          tokio::task::yield_now().await;
        }
        channel.attach()
      })
    })
    .collect();

  let mut held = Vec::new();
  for worker in workers {
    held.push(worker.await.unwrap());
  }
  assert_eq!(channel.lease_count(), 4);
  assert!(channel.is_active());

  held.clear();
  assert_eq!(channel.lease_count(), 0);
  assert!(!channel.is_active());
}

// =============================================================================
// Polling Fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_polling_covers_outage_and_yields_to_push() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let (polls, poll) = counting(
    Duration::from_secs(2),
    json!({"health": {}, "metrics": {"cpu": {"usage": 1}}}),
  );
  let channel = client.push_channel(mock.clone()).fallback(poll).build();
  let _lease = channel.attach();

  // first connect fails, polling starts right away
  settle().await;
  assert_eq!(channel.state(), ConnectionState::Error);
  assert!(channel.is_polling());
  assert_eq!(calls(&polls), 1);

  // the retry at 1s succeeds while the poll is still in flight
  let mut remote = mock.accept_next();
  tokio::time::sleep(Duration::from_secs(1)).await;
  assert_eq!(channel.state(), ConnectionState::Connected);
  assert!(!channel.is_polling());
  assert_eq!(remote.commands.recv().await, Some(ClientEvent::RequestInitialData));

  remote.push(event(json!({
    "event": "metricsUpdate",
    "data": {"health": {}, "metrics": {"cpu": {"usage": 42}}}
  })));
  settle().await;
  assert_eq!(cached(&client, METRICS).unwrap()["metrics"]["cpu"]["usage"], 42);

  // the late poll result must not clobber pushed data
  tokio::time::sleep(Duration::from_secs(3)).await;
  assert_eq!(cached(&client, METRICS).unwrap()["metrics"]["cpu"]["usage"], 42);
  assert_eq!(client.fetcher().stats().discarded, 1);
  assert_eq!(calls(&polls), 1);

  // connection drops, polling takes over again
  drop(remote);
  settle().await;
  assert_eq!(channel.state(), ConnectionState::Disconnected);
  assert!(channel.is_polling());
  assert_eq!(calls(&polls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_polling_runs_on_interval_while_down() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let (polls, poll) = counting(Duration::ZERO, json!({"health": {}, "metrics": {}}));
  let channel = client.push_channel(mock.clone()).fallback(poll).build();
  let _lease = channel.attach();

  settle().await;
  assert_eq!(calls(&polls), 1);
  tokio::time::sleep(Duration::from_secs(15)).await;
  assert_eq!(calls(&polls), 2);
  tokio::time::sleep(Duration::from_secs(15)).await;
  assert_eq!(calls(&polls), 3);
  assert!(cached(&client, METRICS).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_mode_polls_without_connecting() {
  let client = SwrClient::default();
  let mock = MockTransport::new();
  let (polls, poll) = counting(Duration::ZERO, json!({"health": {}, "metrics": {}}));
  let options = HookOptions {
    auto_connect: false,
    ..HookOptions::default()
  };
  let channel = client
    .push_channel(mock.clone())
    .options(options)
    .fallback(poll)
    .build();

  let lease = channel.attach();
  settle().await;
  assert_eq!(mock.attempts(), 0);
  assert!(channel.is_polling());
  assert_eq!(calls(&polls), 1);

  drop(lease);
  assert!(!channel.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_metrics_falls_back_to_producer() {
  let client = SwrClient::default();
  let (polls, poll) = counting(
    Duration::ZERO,
    json!({"health": {}, "metrics": {"cpu": {"usage": 3}}}),
  );
  let channel = client
    .push_channel(MockTransport::new())
    .fallback(poll)
    .build();

  channel.refresh_metrics().await.unwrap();
  assert_eq!(calls(&polls), 1);
  assert_eq!(cached(&client, METRICS).unwrap()["metrics"]["cpu"]["usage"], 3);
}
