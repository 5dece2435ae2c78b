// Fail-over protection for protocol round-trips.
//
// Every protected operation runs with the connection's fail-over mutex held,
// so a round-trip either completes before fail-over begins or is cleanly
// rewound by it. Policies decide what happens to a rewound operation.
use std::future::Future;
use tracing::{debug, info};

use crate::connection::ConnectionHandle;
use crate::error::Result;

/// Run an idempotent operation, retrying from the beginning after the
/// connection has been rebuilt and resubscription has completed.
///
/// Never used for commit, rollback or recover: those must surface a
/// status-uncertain failure instead of retrying.
pub(crate) async fn retry_protected<T, F, Fut>(
    connection: &ConnectionHandle,
    op_name: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        // Snapshot the epoch before taking the mutex so a reconnect that
        // completes while the attempt runs is not missed.
        let mut epoch = connection.epoch_receiver();
        epoch.borrow_and_update();
        let outcome = {
            let _guard = connection.failover_mutex().lock().await;
            op().await
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_failover() => {
                info!(op = op_name, "fail-over interrupted operation; retrying after resubscription");
                if epoch.changed().await.is_err() {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run an operation the fail-over process itself will redo; if fail-over
/// interrupts it, abandon silently and report `None`.
pub(crate) async fn noop_protected<T, F, Fut>(
    connection: &ConnectionHandle,
    op_name: &'static str,
    op: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = {
        let _guard = connection.failover_mutex().lock().await;
        op().await
    };
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_failover() => {
            debug!(op = op_name, "fail-over interrupted operation; abandoning, resubscription will redo it");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
