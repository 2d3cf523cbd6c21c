use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;

use super::backoff::{Backoff, BackoffError};
use super::completion::CompletionTracker;
use super::listener::{CompletionListener, SubscriptionListener};
use super::options::{ConnectOptions, Endpoint, SubscriptionOptions};
use super::request::Correlator;
use super::state::ConnectionState;
use super::subscription::{Subscription, SubscriptionManager, SubscriptionState};
use super::{Connection, tls};
use crate::message::{Message, ReplyAddress};
use crate::transport::close::CloseCode;
use crate::transport::message::{AckMode, ClientMessage, Delivery, DurableType};
use crate::utils::error::{Error, ErrorCode};

struct Ignore;

impl SubscriptionListener for Ignore {
    fn on_messages(&self, _connection: &Connection, _messages: &[Message]) {}
}

fn prepare(seq: u64, matcher: &str, durable: Option<&str>, options: SubscriptionOptions) -> Subscription {
    Subscription::prepare(seq, matcher, durable, options, Arc::new(Ignore)).unwrap()
}

#[derive(Default)]
struct Outcomes(Mutex<Vec<String>>);

impl CompletionListener for Arc<Outcomes> {
    fn on_completion(&self, message: &Message) {
        self.0
            .lock()
            .unwrap()
            .push(format!("ok:{}", message.get_string("n").unwrap_or_default()));
    }

    fn on_error(&self, message: &Message, code: u16, _reason: &str) {
        self.0.lock().unwrap().push(format!(
            "err:{}:{code}",
            message.get_string("n").unwrap_or_default()
        ));
    }
}

// ----- backoff -----

#[test]
fn backoff_doubles_and_caps() {
    let mut backoff = Backoff::new(6, Duration::from_secs(5));
    let delays: Vec<_> = std::iter::from_fn(|| backoff.next_sleep().ok())
        .map(|(_, d)| d.as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 5, 5, 5]);
}

#[test]
fn backoff_default_schedule() {
    let mut backoff = Backoff::default();
    for (expected_attempt, expected) in [(1, 1), (2, 2), (3, 4), (4, 8), (5, 16)] {
        let (attempt, delay) = backoff.next_sleep().unwrap();
        assert_eq!(attempt, expected_attempt);
        assert_eq!(delay, Duration::from_secs(expected));
    }
    assert_eq!(
        backoff.next_sleep(),
        Err(BackoffError::MaxAttemptLimitError(5))
    );
}

#[test]
fn backoff_reset_starts_over() {
    let mut backoff = Backoff::default();
    backoff.next_sleep().unwrap();
    backoff.next_sleep().unwrap();
    backoff.reset();
    assert_eq!(backoff.attempt(), 0);
    assert_eq!(backoff.next_sleep().unwrap(), (1, Duration::from_secs(1)));
}

#[test]
fn backoff_sub_second_cap() {
    let backoff = Backoff::new(3, Duration::from_millis(100));
    assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
    assert_eq!(backoff.delay_for(40), Duration::from_millis(100));
}

#[test]
fn backoff_zero_attempts_gives_up_immediately() {
    let mut backoff = Backoff::new(0, Duration::from_secs(30));
    assert!(backoff.next_sleep().is_err());
}

// ----- state -----

#[test]
fn state_display() {
    assert_eq!(ConnectionState::Connected.to_string(), "Connected");
    let state = ConnectionState::Reconnecting {
        attempt: 2,
        delay: Duration::from_secs(2),
    };
    assert_eq!(state.to_string(), "Reconnecting (attempt 2 in 2 seconds)");
    assert!(state.is_reconnecting());
    assert!(ConnectionState::Failed.is_closed());
    assert!(ConnectionState::Disconnected.is_closed());
    assert!(!ConnectionState::Connecting.is_closed());
}

// ----- options -----

#[test]
fn endpoint_parses_credentials_and_client_id() {
    let ep = Endpoint::parse("ws://u:p@example.com:9191/chan?clientId=abc").unwrap();
    assert_eq!(ep.username(), Some("u"));
    assert_eq!(ep.password(), Some("p"));
    assert_eq!(ep.client_id(), Some("abc"));
    assert_eq!(ep.host(), "example.com");
    assert_eq!(ep.port(), 9191);
    assert_eq!(ep.channel(), "/chan");
    assert_eq!(ep.as_str(), "ws://example.com:9191/chan");
    assert!(!ep.is_secure());
}

#[test]
fn endpoint_percent_decodes_credentials() {
    let ep = Endpoint::parse("ws://a%40b:p%3Aw%20d@example.com/chan").unwrap();
    assert_eq!(ep.username(), Some("a@b"));
    assert_eq!(ep.password(), Some("p:w d"));
    assert_eq!(ep.as_str(), "ws://example.com/chan");
}

#[test]
fn endpoint_default_ports() {
    assert_eq!(Endpoint::parse("wss://example.com/chan").unwrap().port(), 443);
    assert_eq!(Endpoint::parse("ws://example.com/chan").unwrap().port(), 80);
}

#[test]
fn endpoint_rejects_malformed_urls() {
    for bad in [
        "not a url",
        "http://example.com/chan",
        "ws://example.com",
        "ws://example.com/",
    ] {
        let err = Endpoint::parse(bad).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument.as_u16(), "{bad}");
    }
}

#[test]
fn connect_options_defaults_and_camel_case() {
    let opts = ConnectOptions::new();
    assert_eq!(opts.timeout(), Duration::from_secs(15));
    assert_eq!(opts.auto_reconnect_attempts(), 5);
    assert_eq!(opts.auto_reconnect_max_delay(), Duration::from_secs(30));

    let opts: ConnectOptions = serde_json::from_value(json!({
        "username": "u",
        "clientId": "c1",
        "timeoutSeconds": 2.5,
        "autoReconnectAttempts": 3,
        "autoReconnectMaxDelaySeconds": 10
    }))
    .unwrap();
    assert_eq!(opts.client_id.as_deref(), Some("c1"));
    assert_eq!(opts.timeout(), Duration::from_millis(2500));
    assert_eq!(opts.auto_reconnect_attempts(), 3);
    assert_eq!(opts.auto_reconnect_max_delay(), Duration::from_secs(10));
}

#[test]
fn connect_options_validation() {
    let bad = ConnectOptions {
        timeout_seconds: Some(-1.0),
        ..ConnectOptions::default()
    };
    assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));
    let bad = ConnectOptions {
        auto_reconnect_max_delay_seconds: Some(f64::NAN),
        ..ConnectOptions::default()
    };
    assert!(bad.validate().is_err());
    assert!(ConnectOptions::new().validate().is_ok());
}

#[test]
fn oversized_durations_are_rejected_without_panicking() {
    let huge = ConnectOptions {
        timeout_seconds: Some(1e20),
        ..ConnectOptions::default()
    };
    assert!(matches!(huge.validate(), Err(Error::InvalidArgument(_))));
    assert_eq!(huge.timeout(), Duration::from_secs(15));

    let huge = ConnectOptions {
        auto_reconnect_max_delay_seconds: Some(f64::MAX),
        ..ConnectOptions::default()
    };
    assert!(huge.validate().is_err());
    assert_eq!(huge.auto_reconnect_max_delay(), Duration::from_secs(30));
}

#[tokio::test]
async fn connect_rejects_oversized_timeout() {
    let options = ConnectOptions {
        timeout_seconds: Some(1e20),
        ..ConnectOptions::default()
    };
    let err = Connection::connect("ws://127.0.0.1:1/channel", options, super::NoopListener)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument.as_u16());
}

#[test]
fn merged_options_require_fresh_credentials() {
    let stored = ConnectOptions::new()
        .with_credentials("u", "p")
        .with_client_id("c1")
        .with_auto_reconnect(2, Duration::from_secs(4));
    let merged = ConnectOptions::new().merged_over(&stored);
    assert_eq!(merged.username, None);
    assert_eq!(merged.password, None);
    assert_eq!(merged.client_id.as_deref(), Some("c1"));
    assert_eq!(merged.auto_reconnect_attempts(), 2);

    let merged = ConnectOptions::new()
        .with_credentials("v", "q")
        .with_client_id("c2")
        .merged_over(&stored);
    assert_eq!(merged.username.as_deref(), Some("v"));
    assert_eq!(merged.client_id.as_deref(), Some("c2"));
}

#[test]
fn subscription_options_serde() {
    let opts: SubscriptionOptions = serde_json::from_value(json!({
        "durableType": "lastValue",
        "durableKey": "symbol",
        "ackMode": "client"
    }))
    .unwrap();
    assert_eq!(opts.durable_type, Some(DurableType::LastValue));
    assert_eq!(opts.ack_mode, AckMode::Client);
    assert_eq!(SubscriptionOptions::default().ack_mode, AckMode::Auto);
}

// ----- subscriptions -----

#[test]
fn subscription_ids() {
    assert_eq!(prepare(7, "{}", None, SubscriptionOptions::new()).id, "s.7");
    assert_eq!(
        prepare(8, "{}", Some("orders"), SubscriptionOptions::shared()).id,
        "d.orders"
    );
}

#[test]
fn subscription_validation() {
    let check = |matcher: &str, durable: Option<&str>, options: SubscriptionOptions| {
        Subscription::prepare(1, matcher, durable, options, Arc::new(Ignore))
            .err()
            .map(|e| e.code())
    };
    let invalid = Some(ErrorCode::SubscriptionInvalid.as_u16());

    assert_eq!(check("{bad", None, SubscriptionOptions::new()), invalid);
    assert_eq!(check("{}", Some(""), SubscriptionOptions::new()), invalid);
    assert_eq!(check("{}", None, SubscriptionOptions::shared()), invalid);
    assert_eq!(
        check("{}", Some("lv"), SubscriptionOptions::last_value("symbol")),
        invalid
    );
    let mut no_key = SubscriptionOptions::last_value("");
    no_key.durable_key = None;
    assert_eq!(check(r#"{"symbol":true}"#, Some("lv"), no_key), invalid);
    assert_eq!(
        check(
            r#"{"symbol":true}"#,
            Some("lv"),
            SubscriptionOptions::last_value("symbol")
        ),
        None
    );
}

#[test]
fn duplicate_live_durable_is_rejected() {
    let mut subs = SubscriptionManager::new();
    subs.insert(prepare(1, "{}", Some("d"), SubscriptionOptions::new()))
        .unwrap();
    let err = subs
        .insert(prepare(2, "{}", Some("d"), SubscriptionOptions::new()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SubscriptionInvalid.as_u16());
    assert_eq!(subs.ids(), vec!["d.d".to_string()]);
}

#[test]
fn resubscribe_frames_keep_creation_order() {
    let mut subs = SubscriptionManager::new();
    subs.insert(prepare(1, r#"{"a":1}"#, None, SubscriptionOptions::new()))
        .unwrap();
    subs.insert(prepare(2, "{}", Some("dur"), SubscriptionOptions::shared()))
        .unwrap();
    subs.insert(prepare(3, "{}", None, SubscriptionOptions::new()))
        .unwrap();
    subs.activate("s.1");
    subs.activate("d.dur");
    subs.mark_all_pending();
    assert_eq!(subs.get("s.1").unwrap().state, SubscriptionState::Pending);

    let ids: Vec<String> = subs
        .resubscribe_frames()
        .into_iter()
        .map(|f| match f {
            ClientMessage::Subscribe { id, .. } => id,
            other => panic!("unexpected frame {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec!["s.1", "d.dur", "s.3"]);

    match subs.get("d.dur").unwrap().subscribe_frame() {
        ClientMessage::Subscribe {
            matcher,
            durable,
            durable_type,
            ..
        } => {
            assert_eq!(matcher, None);
            assert_eq!(durable.as_deref(), Some("dur"));
            assert_eq!(durable_type, Some(DurableType::Shared));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn untargeted_delivery_fans_out_by_matcher() {
    let mut subs = SubscriptionManager::new();
    subs.insert(prepare(1, r#"{"type":"hello"}"#, None, SubscriptionOptions::new()))
        .unwrap();
    subs.insert(prepare(2, "{}", None, SubscriptionOptions::new()))
        .unwrap();
    subs.insert(prepare(3, r#"{"type":"bye"}"#, None, SubscriptionOptions::new()))
        .unwrap();
    subs.insert(prepare(4, "{}", Some("dur"), SubscriptionOptions::new()))
        .unwrap();

    let deliveries = vec![
        Delivery {
            seq: None,
            reply_to: None,
            body: json!({"type": "hello", "text": "hi"}),
        },
        Delivery {
            seq: None,
            reply_to: None,
            body: json!({"type": "other"}),
        },
    ];
    let dispatches = subs.route(None, deliveries);
    let summary: Vec<(String, usize)> = dispatches
        .iter()
        .map(|d| (d.subscription.clone(), d.messages.len()))
        .collect();
    assert_eq!(summary, vec![("s.1".to_string(), 1), ("s.2".to_string(), 2)]);
}

#[test]
fn targeted_delivery_carries_ack_and_reply_metadata() {
    let mut subs = SubscriptionManager::new();
    subs.insert(prepare(
        1,
        "{}",
        Some("dur"),
        SubscriptionOptions::new().with_ack_mode(AckMode::Client),
    ))
    .unwrap();

    let reply_to = ReplyAddress {
        client_id: "c".into(),
        request_id: 9,
    };
    let dispatches = subs.route(
        Some("d.dur"),
        vec![
            Delivery {
                seq: Some(4),
                reply_to: None,
                body: json!({"n": 1}),
            },
            Delivery {
                seq: Some(5),
                reply_to: Some(reply_to.clone()),
                body: json!({"n": 2}),
            },
            Delivery {
                seq: Some(6),
                reply_to: None,
                body: json!("not an object"),
            },
        ],
    );
    assert_eq!(dispatches.len(), 1);
    let dispatch = &dispatches[0];
    assert_eq!(dispatch.ack_mode, AckMode::Client);
    assert_eq!(dispatch.messages.len(), 2);
    assert_eq!(dispatch.last_seq(), Some(5));
    assert!(!dispatch.messages[0].is_request());
    assert_eq!(dispatch.messages[1].reply_to(), Some(&reply_to));
    assert_eq!(dispatch.messages[1].delivery().unwrap().seq, 5);

    assert!(subs.route(Some("d.unknown"), vec![]).is_empty());
}

#[test]
fn removed_subscription_receives_nothing() {
    let mut subs = SubscriptionManager::new();
    subs.insert(prepare(1, "{}", None, SubscriptionOptions::new()))
        .unwrap();
    let removed = subs.remove("s.1").unwrap();
    assert_eq!(removed.state, SubscriptionState::Closed);
    let dispatches = subs.route(
        None,
        vec![Delivery {
            seq: None,
            reply_to: None,
            body: json!({}),
        }],
    );
    assert!(dispatches.is_empty());
    assert!(subs.fail("s.1").is_none());
}

// ----- completions -----

#[test]
fn completion_fires_exactly_once() {
    let outcomes = Arc::new(Outcomes::default());
    let mut tracker = CompletionTracker::new();
    tracker.register(1, Message::new().with("n", "a"), Arc::new(outcomes.clone()));
    tracker.register(2, Message::new().with("n", "b"), Arc::new(outcomes.clone()));
    tracker.register(3, Message::new().with("n", "c"), Arc::new(outcomes.clone()));

    tracker.complete(2);
    tracker.complete(2);
    tracker.fail(1, ErrorCode::PublishDisallowed.as_u16(), "no");
    tracker.complete(1);
    tracker.fail_all(&Error::connection(CloseCode::ConnectionError, "lost"));
    tracker.fail_all(&Error::connection(CloseCode::ConnectionError, "lost"));

    tracker.complete(3);
    assert_eq!(
        *outcomes.0.lock().unwrap(),
        vec!["ok:b", "err:a:12", "err:c:1006"]
    );
}

// ----- correlator -----

#[tokio::test]
async fn correlator_accepts_one_answer() {
    let mut requests: Correlator<Message> = Correlator::new("request");
    let (tx, rx) = oneshot::channel();
    requests.register(1, tx);
    assert!(!requests.resolve(2, Ok(Message::new())));

    assert!(requests.resolve(1, Ok(Message::new().with("n", "first"))));
    assert!(!requests.resolve(1, Ok(Message::new().with("n", "second"))));

    let reply = rx.await.unwrap().unwrap();
    assert_eq!(reply.get_string("n"), Some("first"));
}

#[tokio::test]
async fn correlator_fails_everything_on_loss() {
    let mut maps: Correlator<Option<Message>> = Correlator::new("map operation");
    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    maps.register(1, tx1);
    maps.register(2, tx2);
    maps.expire(2);
    maps.fail_all(&Error::connection(CloseCode::ConnectionError, "lost"));

    let err = rx1.await.unwrap().unwrap_err();
    assert_eq!(err.code(), 1006);
    assert!(rx2.await.is_err());
    assert!(!maps.resolve(1, Ok(None)));
}

// ----- tls -----

#[test]
fn trust_store_is_frozen_after_first_connect() {
    tls::mark_connected();
    assert!(matches!(tls::set_trust_all(true), Err(Error::AlreadyConnected)));
    assert!(matches!(
        tls::set_trust_store(b"-----BEGIN CERTIFICATE-----"),
        Err(Error::AlreadyConnected)
    ));
}

// ----- connection -----

#[tokio::test]
async fn connect_rejects_bad_url_synchronously() {
    let err = Connection::connect("ftp://host/chan", ConnectOptions::new(), super::NoopListener)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument.as_u16());
}

#[tokio::test]
async fn connect_to_closed_port_fails_with_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = Connection::connect(
        &format!("ws://127.0.0.1:{port}/channel"),
        ConnectOptions::new().with_timeout(Duration::from_secs(2)),
        super::NoopListener,
    )
    .await
    .unwrap_err();
    assert_eq!(err.close_code(), Some(CloseCode::ConnectionError));
}
