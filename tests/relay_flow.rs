//! End-to-end relay tests over the in-process messenger.
//!
//! Each test configures a relay from a fixed key map, starts it against a
//! `MemoryMessenger`, and checks what was sent where.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use tg_relay::app::Relay;
use tg_relay::channels::{ChatHandle, MemoryMessenger, SendOptions};
use tg_relay::config::RelayConfig;
use tg_relay::error::{ChannelError, Error};
use tg_relay::pipeline::relay::{SELF_TEST_PREFIX, SelfTestOutcome, format_enrichment};

/// Maximum time any test is allowed to wait before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Chats {
    source: ChatHandle,
    destination: ChatHandle,
    counterpart: ChatHandle,
}

async fn register_all(messenger: &MemoryMessenger) -> Chats {
    Chats {
        source: messenger.register("source_bot", 100).await,
        destination: messenger.register("dest_channel", -1001).await,
        counterpart: messenger.register("PriceNFTbot", 500).await,
    }
}

fn config(overrides: &[(&str, &str)]) -> RelayConfig {
    let mut vars: HashMap<String, String> = [
        ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ("RELAY_SOURCE", "@source_bot"),
        ("RELAY_DESTINATION", "-1001"),
        ("RELAY_SELF_TEST", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    RelayConfig::from_lookup(|key| vars.get(key).cloned()).expect("valid test config")
}

/// Poll until `chat` has received `count` sends.
async fn wait_for_sends(messenger: &MemoryMessenger, chat: &ChatHandle, count: usize) {
    timeout(TEST_TIMEOUT, async {
        while messenger.sent_to(chat).await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for sends");
}

#[tokio::test]
async fn relays_messages_until_shutdown() {
    let messenger = Arc::new(MemoryMessenger::new());
    let chats = register_all(&messenger).await;
    messenger
        .reply_on_next_message(&chats.counterpart, "Оценка: 7,5 TON ≈ 21.4 $")
        .await;

    let relay = Relay::start(&config(&[]), messenger.clone()).await.unwrap();
    assert!(messenger.is_connected());
    assert!(relay.self_test().is_none());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(relay.run(async {
        let _ = stop_rx.await;
    }));

    messenger.inject(&chats.source, &chats.source, "@alice_99 ID: 123456 /start");
    messenger.inject(&chats.source, &chats.source, "просто болтовня");
    let auth = messenger.inject(
        &chats.source,
        &chats.source,
        "🍏 УСПЕШНАЯ АВТОРИЗАЦИЯ\nПользователь: @victim_1",
    );

    // structured + raw forward + enrichment
    wait_for_sends(&messenger, &chats.destination, 3).await;
    wait_for_sends(&messenger, &chats.source, 1).await;

    let to_destination: Vec<String> = messenger
        .sent_to(&chats.destination)
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(to_destination.contains(
        &"🎯 Новый переход!\n\n👤 Пользователь: @alice_99 (ID: 123456)\n💻 Действие: /start"
            .to_string()
    ));
    assert!(to_destination.contains(&auth.raw_text));
    assert!(to_destination.contains(&format_enrichment("7,5 TON ≈ 21.4 $")));
    assert!(!to_destination.iter().any(|t| t == "просто болтовня"));

    let reply = &messenger.sent_to(&chats.source).await[0];
    assert_eq!(reply.options, SendOptions::html().replying_to(auth.id));

    let queries = messenger.sent_to(&chats.counterpart).await;
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].text, "@victim_1");

    stop_tx.send(()).unwrap();
    timeout(TEST_TIMEOUT, running)
        .await
        .expect("relay did not stop")
        .unwrap()
        .unwrap();
    assert!(!messenger.is_connected());
}

#[tokio::test]
async fn raw_forward_permission_failure_does_not_stop_consultation() {
    let messenger = Arc::new(MemoryMessenger::new());
    let chats = register_all(&messenger).await;
    messenger
        .reply_on_next_message(&chats.counterpart, "1 TON ≈ 3 $")
        .await;
    messenger
        .fail_sends_to(
            &chats.destination,
            ChannelError::PermissionDenied {
                name: "memory".into(),
                reason: "not enough rights".into(),
            },
        )
        .await;

    let relay = Relay::start(&config(&[]), messenger.clone()).await.unwrap();
    let msg = messenger.inject(&chats.source, &chats.source, "🍏 УСПЕШНАЯ АВТОРИЗАЦИЯ @victim_9");
    let sends = relay.engine().handle(&msg).await;

    assert_eq!(sends.len(), 4);
    assert!(!sends[0].delivered());
    assert!(sends[1].delivered());
    assert!(sends[2].delivered());
    assert!(!sends[3].delivered());
    assert_eq!(messenger.sent_to(&chats.source).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_counterpart_times_out_without_enrichment() {
    let messenger = Arc::new(MemoryMessenger::new());
    let chats = register_all(&messenger).await;

    let relay = Relay::start(&config(&[("RELAY_CONSULT_TIMEOUT_SECS", "3")]), messenger.clone())
        .await
        .unwrap();
    let msg = messenger.inject(&chats.source, &chats.source, "🍏 УСПЕШНАЯ АВТОРИЗАЦИЯ @quiet_one");

    let started = tokio::time::Instant::now();
    let sends = relay.engine().handle(&msg).await;

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(sends.len(), 2);
    assert!(messenger.sent_to(&chats.source).await.is_empty());
}

#[tokio::test]
async fn self_test_reports_with_prefix() {
    let messenger = Arc::new(MemoryMessenger::new());
    let chats = register_all(&messenger).await;
    messenger
        .reply_on_next_message(&chats.counterpart, "Подарки: 2 TON ≈ 6 $")
        .await;

    let relay = Relay::start(
        &config(&[
            ("RELAY_SELF_TEST", "true"),
            ("RELAY_SELF_TEST_IDENTITY", "@check_user"),
        ]),
        messenger.clone(),
    )
    .await
    .unwrap();

    assert_eq!(
        relay.self_test(),
        Some(&SelfTestOutcome::Reported {
            phrase: "2 TON ≈ 6 $".into(),
            delivered: true,
        })
    );
    assert_eq!(messenger.sent_to(&chats.counterpart).await[0].text, "@check_user");
    let report = &messenger.sent_to(&chats.destination).await[0];
    assert_eq!(
        report.text,
        format!("{SELF_TEST_PREFIX}{}", format_enrichment("2 TON ≈ 6 $"))
    );
}

#[tokio::test]
async fn self_test_without_identity_is_skipped() {
    let messenger = Arc::new(MemoryMessenger::new());
    let chats = register_all(&messenger).await;

    let relay = Relay::start(&config(&[("RELAY_SELF_TEST", "true")]), messenger.clone())
        .await
        .unwrap();

    assert!(matches!(relay.self_test(), Some(SelfTestOutcome::Skipped(_))));
    assert!(messenger.sent_to(&chats.counterpart).await.is_empty());
}

#[tokio::test]
async fn unresolved_destination_is_fatal() {
    let messenger = Arc::new(MemoryMessenger::new());
    messenger.register("source_bot", 100).await;

    let result = Relay::start(&config(&[]), messenger.clone()).await;
    assert!(matches!(
        result,
        Err(Error::Channel(ChannelError::ResolutionFailed { .. }))
    ));
}

#[tokio::test]
async fn unresolved_counterpart_disables_consultation() {
    let messenger = Arc::new(MemoryMessenger::new());
    let source = messenger.register("source_bot", 100).await;
    messenger.register("dest_channel", -1001).await;

    let relay = Relay::start(&config(&[("RELAY_COUNTERPART", "@missing_bot")]), messenger.clone())
        .await
        .unwrap();
    assert!(relay.engine().counterpart().is_none());

    let msg = messenger.inject(&source, &source, "🍏 УСПЕШНАЯ АВТОРИЗАЦИЯ @victim_2");
    let sends = relay.engine().handle(&msg).await;
    assert_eq!(sends.len(), 1);
    assert!(sends[0].delivered());
}

#[tokio::test(start_paused = true)]
async fn pending_consultation_does_not_block_other_messages() {
    let messenger = Arc::new(MemoryMessenger::new());
    let chats = register_all(&messenger).await;

    let config = config(&[]);
    let relay = Relay::start(&config, messenger.clone()).await.unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(relay.run(async {
        let _ = stop_rx.await;
    }));

    let started = tokio::time::Instant::now();
    messenger.inject(&chats.source, &chats.source, "🍏 УСПЕШНАЯ АВТОРИЗАЦИЯ @slow_user");
    wait_for_sends(&messenger, &chats.counterpart, 1).await;

    // The counterpart stays silent; the next message must not wait for it.
    messenger.inject(&chats.source, &chats.source, "@alice_99 ID: 123456 /start");
    wait_for_sends(&messenger, &chats.destination, 2).await;
    assert!(started.elapsed() < config.consult_timeout);

    let to_destination: Vec<String> = messenger
        .sent_to(&chats.destination)
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(to_destination.iter().any(|t| t.starts_with("🎯 Новый переход!")));

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(30), running)
        .await
        .expect("relay did not stop")
        .unwrap()
        .unwrap();
    assert!(started.elapsed() >= config.consult_timeout);
    assert!(messenger.sent_to(&chats.source).await.is_empty());
}
