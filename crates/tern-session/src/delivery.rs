// Inbound message envelopes produced by the codec on the network task.
use bytes::{Bytes, BytesMut};
use std::fmt;
use tern_wire::{BasicProperties, ContentHeader};

/// Client-generated identifier associating deliveries with a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerTag(pub u64);

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message the broker pushed to a consumer on this channel.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: ConsumerTag,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub header: ContentHeader,
    pub bodies: Vec<Bytes>,
}

impl Delivery {
    /// Assembled payload; single-body deliveries are returned without copying.
    pub fn payload(&self) -> Bytes {
        concat_bodies(&self.bodies)
    }
}

/// A publish the broker returned as unroutable.
#[derive(Debug, Clone)]
pub struct Bounce {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub header: ContentHeader,
    pub bodies: Vec<Bytes>,
}

/// One decoded inbound envelope: a real delivery or a bounce, never both.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Delivery(Delivery),
    Bounce(Bounce),
}

/// The application-facing view of a dispatched delivery.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub consumer_tag: ConsumerTag,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub payload: Bytes,
}

impl From<Delivery> for DeliveredMessage {
    fn from(delivery: Delivery) -> Self {
        let payload = delivery.payload();
        Self {
            consumer_tag: delivery.consumer_tag,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            properties: delivery.header.properties,
            payload,
        }
    }
}

/// The original message carried inside a bounce error.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub payload: Bytes,
}

impl From<Bounce> for ReturnedMessage {
    fn from(bounce: Bounce) -> Self {
        let payload = concat_bodies(&bounce.bodies);
        Self {
            exchange: bounce.exchange,
            routing_key: bounce.routing_key,
            properties: bounce.header.properties,
            payload,
        }
    }
}

fn concat_bodies(bodies: &[Bytes]) -> Bytes {
    match bodies {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total = many.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for body in many {
                buf.extend_from_slice(body);
            }
            buf.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(bodies: Vec<Bytes>) -> Delivery {
        Delivery {
            consumer_tag: ConsumerTag(1),
            delivery_tag: 9,
            redelivered: false,
            exchange: "amq.direct".into(),
            routing_key: "orders".into(),
            header: ContentHeader::default(),
            bodies,
        }
    }

    #[test]
    fn single_body_payload_is_not_copied() {
        let body = Bytes::from_static(b"payload");
        let d = delivery(vec![body.clone()]);
        assert_eq!(d.payload(), body);
    }

    #[test]
    fn multi_body_payload_is_concatenated() {
        let d = delivery(vec![Bytes::from_static(b"he"), Bytes::from_static(b"llo")]);
        assert_eq!(d.payload(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn delivered_message_carries_envelope_fields() {
        let message = DeliveredMessage::from(delivery(vec![Bytes::from_static(b"x")]));
        assert_eq!(message.delivery_tag, 9);
        assert_eq!(message.routing_key, "orders");
        assert_eq!(message.payload, Bytes::from_static(b"x"));
    }
}
