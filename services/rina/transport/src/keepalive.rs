//! Keep-alive timer for idle flows.
//!
//! The timer fires every interval. Recent activity on the flow postpones the
//! heartbeat for the rest of the interval instead of sending it, so a busy
//! flow never carries keep-alives. Heartbeats go through the regular send
//! path, so their write errors tear the transport down like any other.

use crate::connection::WeakTransport;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What the timer should do when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Activity was seen recently; fire again after this long
    Wait(Duration),
    /// The flow has been idle a full interval; send a heartbeat
    Send,
}

/// Decide between sending and rescheduling
pub fn next_action(interval: Duration, now: Instant, last_activity: Instant) -> KeepAliveAction {
    let idle = now.saturating_duration_since(last_activity);
    if idle < interval {
        KeepAliveAction::Wait(interval - idle)
    } else {
        KeepAliveAction::Send
    }
}

/// Start the timer for a connected transport.
///
/// The task only holds a weak reference and stops once the transport is
/// gone or can no longer send. Cancel it by aborting the handle.
pub(crate) fn spawn(transport: WeakTransport, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    let runtime = transport.upgrade()?.runtime().clone();

    Some(runtime.spawn(async move {
        let mut delay = interval;
        loop {
            tokio::time::sleep(delay).await;

            let Some(transport) = transport.upgrade() else {
                break;
            };
            let _guard = transport.hold();

            match next_action(interval, Instant::now(), transport.last_activity()) {
                KeepAliveAction::Wait(remaining) => {
                    trace!(
                        "{}: recent activity, keep-alive in {:?}",
                        transport.name(),
                        remaining
                    );
                    delay = remaining;
                }
                KeepAliveAction::Send => {
                    let data = transport.config().keepalive_data.clone();
                    if let Err(e) = transport.send(data, None) {
                        debug!("{}: keep-alive send failed: {}", transport.name(), e);
                        transport.on_io_error(e);
                        break;
                    }
                    trace!("{}: keep-alive sent", transport.name());
                    delay = interval;
                }
            }
        }
    }))
}
