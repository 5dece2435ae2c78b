// Translation of broker returns into typed asynchronous errors.
use tern_wire::{REPLY_NO_CONSUMERS, REPLY_NO_ROUTE};
use tracing::debug;

use crate::delivery::{Bounce, ReturnedMessage};
use crate::error::AsyncError;

/// Map a returned (unroutable) publish onto the error the connection error
/// callback surfaces to the application.
pub(crate) fn translate(bounce: Bounce) -> AsyncError {
    debug!(
        reply_code = bounce.reply_code,
        reply_text = %bounce.reply_text,
        exchange = %bounce.exchange,
        routing_key = %bounce.routing_key,
        "publish returned by broker"
    );
    let reply_code = bounce.reply_code;
    let reply_text = bounce.reply_text.clone();
    let message = ReturnedMessage::from(bounce);
    match reply_code {
        REPLY_NO_ROUTE => AsyncError::NoRoute {
            reply_text,
            message,
        },
        REPLY_NO_CONSUMERS => AsyncError::NoConsumers {
            reply_text,
            message,
        },
        code => AsyncError::Undelivered {
            reply_code: code,
            reply_text,
            message,
        },
    }
}
