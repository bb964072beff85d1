//! Registration handshake and logoff.

use meteor_protocol::routing::STILL_REGISTERED;
use tracing::{info, warn};

use crate::error::Result;
use crate::session::{Replier, ServerSession};
use crate::state::SchedulerState;

/// Answer a login with the status exchange name, or the rejection sentinel.
///
/// Returns whether the client is now registered.
pub fn login(
    session: &mut ServerSession,
    state: &mut SchedulerState,
    client_id: &str,
    status_queue: Option<&str>,
    reconnect: bool,
    reply: &Replier,
) -> Result<bool> {
    if session.register(client_id, status_queue, reconnect) {
        state.round_robin.register_client(client_id);
        info!(client_id, reconnect, "client registered");
        reply.reply_text(session.status_exchange())?;
        Ok(true)
    } else {
        warn!(client_id, "registration rejected, id still active");
        reply.reply_text(STILL_REGISTERED)?;
        Ok(false)
    }
}

/// Drop the registration; scheduled jobs stay scheduled.
///
/// Ignored when `status_queue` belongs to a session that was taken over.
pub fn logoff(session: &mut ServerSession, client_id: &str, status_queue: Option<&str>) {
    if session.unregister(client_id, status_queue) {
        info!(client_id, "client logged off");
    } else if session.is_registered(client_id) {
        info!(client_id, "logoff from superseded session ignored");
    } else {
        warn!(client_id, "logoff from unregistered client");
    }
}
