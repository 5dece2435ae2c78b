// Fail-over protection: transparent retry and full resubscription.
mod common;

use anyhow::Result;
use common::{deliver, open_session};
use std::time::Duration;
use tern_session::{AckMode, Destination, SessionError};
use tern_wire::{Method, MethodKind};

#[tokio::test]
async fn resubscription_rebuilds_consumers_in_creation_order() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.connection.start().await?;
    let _producer = h.session.create_producer(&Destination::queue("out")).await?;
    let c1 = h.session.create_consumer(&Destination::queue("q1")).await?;
    let c2 = h.session.create_consumer(&Destination::queue("q2")).await?;
    let c3 = h.session.create_consumer(&Destination::queue("q3")).await?;

    h.mock.clear_frames();
    h.connection.failover_rebuild().await?;

    let methods = h.mock.methods();
    // The producer's exchange is re-declared before consumers resubscribe.
    assert!(matches!(
        methods.first(),
        Some(Method::ExchangeDeclare { nowait: true, .. })
    ));
    let declared: Vec<String> = methods
        .iter()
        .filter_map(|m| match m {
            Method::QueueDeclare { queue, .. } => Some(queue.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(declared, vec!["q1", "q2", "q3"]);
    let consumed: Vec<(u64, bool)> = methods
        .iter()
        .filter_map(|m| match m {
            Method::BasicConsume {
                consumer_tag,
                nowait,
                ..
            } => Some((*consumer_tag, *nowait)),
            _ => None,
        })
        .collect();
    assert_eq!(
        consumed,
        vec![(c1.tag().0, true), (c2.tag().0, true), (c3.tag().0, true)],
        "consumers resubscribe in creation order with nowait"
    );
    assert_eq!(h.mock.count_kind(MethodKind::QueueBind), 3);

    // Deliveries resume after the rebuild.
    deliver(&h.session, &c1, 10, b"resumed");
    assert_eq!(c1.receive().await?.expect("resumed").delivery_tag, 10);
    deliver(&h.session, &c2, 11, b"resumed");
    assert_eq!(c2.receive().await?.expect("resumed").delivery_tag, 11);
    deliver(&h.session, &c3, 12, b"resumed");
    assert_eq!(c3.receive().await?.expect("resumed").delivery_tag, 12);
    Ok(())
}

#[tokio::test]
async fn retry_policy_reruns_declare_after_reconnect() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.mock.fail_next(
        MethodKind::QueueDeclare,
        SessionError::FailoverInterrupted { op: "round-trip" },
    );
    let rebuild = h.connection.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        rebuild.failover_rebuild().await.expect("rebuild");
    });

    let name = h.session.declare_queue(&Destination::queue("rq")).await?;
    assert_eq!(name, "rq");
    assert_eq!(
        h.mock.count_kind(MethodKind::QueueDeclare),
        2,
        "first attempt interrupted, second attempt after resubscription"
    );
    Ok(())
}

#[tokio::test]
async fn generated_queue_names_are_refreshed_on_resubscribe() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.connection.start().await?;
    let topic = Destination::topic("market.ticks");
    let _consumer = h.session.create_consumer(&topic).await?;
    let first_name = topic.queue_name().expect("generated name");

    h.connection.failover_rebuild().await?;
    let second_name = topic.queue_name().expect("regenerated name");
    assert_ne!(
        first_name, second_name,
        "server-generated names are regenerated from the name-required flag"
    );
    Ok(())
}

#[tokio::test]
async fn close_ignores_failover_interruption() -> Result<()> {
    let h = open_session(false, AckMode::Auto).await;
    h.mock.fail_next(
        MethodKind::ChannelClose,
        SessionError::FailoverInterrupted { op: "round-trip" },
    );
    h.session.close(Some(Duration::from_secs(1))).await?;
    assert!(h.session.is_closed());
    assert_eq!(h.mock.count_kind(MethodKind::ChannelClose), 1);
    Ok(())
}
