// Watermark-driven flow control, bounce routing, and cancellation paths.
mod common;

use anyhow::Result;
use bytes::Bytes;
use common::{deliver, open_session, open_session_with, wait_until};
use tern_session::{
    AckMode, AsyncError, Bounce, ConsumerOptions, Destination, InboundMessage, ProducerOptions,
    SessionError, SessionSettings,
};
use tern_wire::{ContentHeader, Method, MethodKind, REPLY_NO_ROUTE};

#[tokio::test]
async fn no_ack_watermarks_toggle_channel_flow() -> Result<()> {
    let settings = SessionSettings {
        prefetch_high: 3,
        prefetch_low: 1,
        immediate_prefetch: true,
        ..SessionSettings::default()
    };
    let h = open_session_with(false, AckMode::NoAck, settings).await;
    h.connection.start().await?;
    let consumer = h.session.create_consumer(&Destination::queue("firehose")).await?;

    // No dispatcher yet, so the queue fills; the enqueue crossing high=3
    // schedules a suspension.
    for tag in 1..=4 {
        deliver(&h.session, &consumer, tag, b"burst");
    }
    wait_until("suspend round-trip", || {
        h.mock
            .methods()
            .into_iter()
            .any(|m| matches!(m, Method::ChannelFlow { active: false }))
    })
    .await;

    // Receiving starts the dispatcher, which drains the queue down to
    // low=1 and schedules the resume.
    consumer.receive().await?.expect("first");
    wait_until("resume round-trip", || {
        h.mock
            .methods()
            .into_iter()
            .any(|m| matches!(m, Method::ChannelFlow { active: true }))
    })
    .await;

    // No acks in no-acknowledge mode.
    assert_eq!(h.mock.count_kind(MethodKind::BasicAck), 0);
    Ok(())
}

#[tokio::test]
async fn bounced_mandatory_publish_surfaces_no_route() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    let producer = h
        .session
        .create_producer_with(
            &Destination::queue("nowhere"),
            ProducerOptions {
                mandatory: true,
                ..ProducerOptions::default()
            },
        )
        .await?;
    let payload = Bytes::from_static(b"undeliverable");
    producer.send(payload.clone()).await?;

    // The broker returns the publish as unroutable.
    h.session.message_received(InboundMessage::Bounce(Bounce {
        reply_code: REPLY_NO_ROUTE,
        reply_text: "no queue bound".into(),
        exchange: "amq.direct".into(),
        routing_key: "nowhere".into(),
        header: ContentHeader::for_payload(&payload, Default::default()),
        bodies: vec![payload.clone()],
    }));

    wait_until("error callback invoked", || h.errors.len() == 1).await;
    match h.errors.take().remove(0) {
        AsyncError::NoRoute { message, .. } => {
            assert_eq!(message.payload, payload);
            assert_eq!(message.routing_key, "nowhere");
        }
        other => panic!("expected NoRoute, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn server_close_propagates_to_consumers_and_error_callback() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.connection.start().await?;
    let consumer = h.session.create_consumer(&Destination::queue("doomed")).await?;

    h.session.closed_by_server("broker shutting down").await;
    assert!(h.session.is_closed());

    wait_until("session-closed error reported", || h.errors.len() == 1).await;
    assert!(matches!(
        h.errors.take().remove(0),
        AsyncError::SessionClosed { channel: 1, .. }
    ));

    let err = consumer.receive().await.expect_err("consumer sees the error");
    assert!(matches!(err, SessionError::Transport(_)));
    Ok(())
}

#[tokio::test]
async fn server_cancel_of_auto_close_consumer_flushes_buffered_deliveries() -> Result<()> {
    let h = open_session(false, AckMode::Client).await;
    h.connection.start().await?;
    let queue = Destination::queue("cancelled");
    let consumer = h
        .session
        .create_consumer_with(
            &queue,
            ConsumerOptions {
                auto_close: true,
                ..ConsumerOptions::default()
            },
        )
        .await?;

    // Deliveries sit in the pre-dispatch queue: no receive has started the
    // dispatcher yet.
    deliver(&h.session, &consumer, 1, b"buffered");
    deliver(&h.session, &consumer, 2, b"buffered");
    h.session.confirm_consumer_cancelled(consumer.tag()).await;

    // Both buffered deliveries are handed out before the close lands.
    assert_eq!(consumer.receive().await?.expect("first").delivery_tag, 1);
    assert_eq!(consumer.receive().await?.expect("second").delivery_tag, 2);
    assert!(consumer.receive().await?.is_none(), "then drained and closed");
    assert!(consumer.is_closed());
    assert!(!h.session.has_consumer(&queue));
    Ok(())
}

#[tokio::test]
async fn server_cancel_of_plain_consumer_requeues_pending() -> Result<()> {
    let h = open_session(false, AckMode::Client).await;
    h.connection.start().await?;
    let queue = Destination::queue("cancelled");
    let consumer = h.session.create_consumer(&queue).await?;

    deliver(&h.session, &consumer, 1, b"pending");
    deliver(&h.session, &consumer, 2, b"pending");
    h.session.confirm_consumer_cancelled(consumer.tag()).await;

    wait_until("pending deliveries requeued", || {
        h.mock.count_kind(MethodKind::BasicReject) == 2
    })
    .await;
    assert!(consumer.is_closed());
    assert!(!h.session.has_consumer(&queue));
    Ok(())
}

#[tokio::test]
async fn unknown_cancellation_is_ignored() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.session
        .confirm_consumer_cancelled(tern_session::ConsumerTag(99))
        .await;
    assert_eq!(h.session.consumer_count(), 0);
    Ok(())
}
