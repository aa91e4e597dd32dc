//! Connection supervision loop.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::shutdown::{LoopGuard, Shutdown};
use crate::bus::Connection;

/// Watch the connection until shutdown, logging every transport error.
///
/// Reconnection belongs to the transport; this loop only observes it.
pub(crate) async fn supervise(
    connection: Arc<dyn Connection>,
    shutdown: Arc<Shutdown>,
    _guard: LoopGuard,
) {
    let mut reporting = true;

    while !shutdown.is_stopped() {
        if !reporting {
            shutdown.cancelled().await;
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            reported = connection.next_error() => match reported {
                Some(e) => error!(error = %e, "Transport error"),
                None => {
                    debug!("Transport stopped reporting errors");
                    reporting = false;
                }
            },
        }
    }

    info!("Connection supervisor stopped");
}
