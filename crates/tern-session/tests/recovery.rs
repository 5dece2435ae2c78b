// Recover semantics, including recover() issued inside a listener callback.
mod common;

use anyhow::Result;
use common::{deliver, deliver_redelivered, open_session, open_session_with, wait_until};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tern_session::{AckMode, Destination, MessageListener, SessionError, SessionSettings};
use tern_wire::{Method, MethodKind};

#[tokio::test]
async fn recover_inside_listener_suppresses_the_auto_ack() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.connection.start().await?;
    let consumer = h.session.create_consumer(&Destination::queue("auto")).await?;

    let seen: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
    let listener_session = h.session.clone();
    let listener_seen = Arc::clone(&seen);
    let listener: MessageListener = Arc::new(move |message| {
        let session = listener_session.clone();
        let seen = Arc::clone(&listener_seen);
        Box::pin(async move {
            seen.lock().expect("seen lock").push(message.delivery_tag);
            if message.delivery_tag == 7 {
                session.recover().await.expect("recover");
            }
        })
    });
    consumer.set_listener(listener).await?;

    deliver(&h.session, &consumer, 7, b"in flight");
    wait_until("listener saw tag 7", || {
        seen.lock().expect("seen lock").contains(&7)
    })
    .await;
    wait_until("basic.recover issued", || {
        h.mock.count_kind(MethodKind::BasicRecover) == 1
    })
    .await;

    // The in-flight message is not auto-acked after recover.
    let acked_7 = h.mock.methods().into_iter().any(|m| {
        matches!(
            m,
            Method::BasicAck {
                delivery_tag: 7,
                ..
            }
        )
    });
    assert!(!acked_7, "tag 7 must not be auto-acked in recovery");

    // The server redelivers; the next delivery is acknowledged normally.
    deliver_redelivered(&h.session, &consumer, 8, b"in flight", true);
    wait_until("redelivery auto-acked", || {
        h.mock.methods().into_iter().any(|m| {
            matches!(
                m,
                Method::BasicAck {
                    delivery_tag: 8,
                    ..
                }
            )
        })
    })
    .await;
    assert_eq!(*seen.lock().expect("seen lock"), vec![7, 8]);
    Ok(())
}

#[tokio::test]
async fn recover_clears_the_unacked_log_without_requeueing() -> Result<()> {
    let h = open_session(false, AckMode::Client).await;
    h.connection.start().await?;
    let consumer = h.session.create_consumer(&Destination::queue("cli")).await?;
    deliver(&h.session, &consumer, 1, b"one");
    deliver(&h.session, &consumer, 2, b"two");
    consumer.receive().await?.expect("one");
    consumer.receive().await?.expect("two");

    h.mock.clear_frames();
    h.session.recover().await?;
    assert_eq!(h.mock.count_kind(MethodKind::BasicRecover), 1);
    // Cleared, not rejected: redelivery comes from the broker side.
    assert_eq!(h.mock.count_kind(MethodKind::BasicReject), 0);

    // The log really is empty: acknowledging now writes nothing.
    h.mock.clear_frames();
    consumer.acknowledge().await?;
    assert_eq!(h.mock.count_kind(MethodKind::BasicAck), 0);
    Ok(())
}

#[tokio::test]
async fn strict_recover_is_fire_and_forget() -> Result<()> {
    let settings = SessionSettings {
        strict: true,
        strict_fatal: false,
        ..SessionSettings::default()
    };
    let h = open_session_with(false, AckMode::Auto, settings).await;
    // A scripted sync failure is never consumed because strict recover does
    // not wait for basic.recover-ok.
    h.mock.fail_next(
        MethodKind::BasicRecover,
        SessionError::Protocol("should not be consumed".into()),
    );
    h.session.recover().await?;
    assert_eq!(h.mock.count_kind(MethodKind::BasicRecover), 1);
    Ok(())
}

#[tokio::test]
async fn recover_interrupted_by_failover_is_status_uncertain() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.mock.fail_next(
        MethodKind::BasicRecover,
        SessionError::FailoverInterrupted { op: "round-trip" },
    );
    let err = h.session.recover().await.expect_err("interrupted");
    assert!(matches!(
        err,
        SessionError::FailoverInterrupted {
            op: "basic.recover"
        }
    ));
    Ok(())
}
