// Error taxonomy for the session runtime.
use tern_wire::ChannelId;

use crate::delivery::ReturnedMessage;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced synchronously to the calling task.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(String),
    #[error("session is closed")]
    Closed,
    #[error("session is not transactional")]
    NotTransacted,
    #[error("session is transactional")]
    IsTransacted,
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
    #[error("already subscribed to topic {topic} under subscription name {name}")]
    AlreadySubscribed { name: String, topic: String },
    #[error("{0}")]
    IllegalState(&'static str),
    #[error("not supported under strict protocol compliance: {0}")]
    Unsupported(&'static str),
    #[error("timed out waiting for {waiting_for:?}")]
    Timeout { waiting_for: tern_wire::MethodKind },
    #[error("fail-over interrupted {op}; outcome is uncertain")]
    FailoverInterrupted { op: &'static str },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// True when the operation was cut short by a connection fail-over.
    pub fn is_failover(&self) -> bool {
        matches!(self, SessionError::FailoverInterrupted { .. })
    }

    /// Rebrand a fail-over interruption with the operation it actually cut
    /// short, leaving every other error untouched.
    pub(crate) fn name_failover_op(self, op: &'static str) -> Self {
        match self {
            SessionError::FailoverInterrupted { .. } => SessionError::FailoverInterrupted { op },
            other => other,
        }
    }
}

impl From<tern_wire::Error> for SessionError {
    fn from(err: tern_wire::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Errors that arrive outside any application call, delivered through the
/// connection error callback.
#[derive(thiserror::Error, Debug)]
pub enum AsyncError {
    #[error("no route for mandatory publish: {reply_text}")]
    NoRoute {
        reply_text: String,
        message: ReturnedMessage,
    },
    #[error("no consumers for immediate publish: {reply_text}")]
    NoConsumers {
        reply_text: String,
        message: ReturnedMessage,
    },
    #[error("undelivered publish (reply code {reply_code}): {reply_text}")]
    Undelivered {
        reply_code: u16,
        reply_text: String,
        message: ReturnedMessage,
    },
    #[error("session on channel {channel} closed by broker: {reason}")]
    SessionClosed { channel: ChannelId, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_detection_only_matches_failover() {
        let failover = SessionError::FailoverInterrupted { op: "tx.commit" };
        assert!(failover.is_failover());
        assert!(!SessionError::Closed.is_failover());
    }

    #[test]
    fn name_failover_op_rebrands_only_failover() {
        let renamed = SessionError::FailoverInterrupted { op: "round-trip" }
            .name_failover_op("tx.rollback");
        assert!(matches!(
            renamed,
            SessionError::FailoverInterrupted { op: "tx.rollback" }
        ));
        let untouched = SessionError::Closed.name_failover_op("tx.rollback");
        assert!(matches!(untouched, SessionError::Closed));
    }
}
