//! Relay queue naming.
//!
//! Every cloud owns a gatekeeper request queue and a gateway control queue
//! on each relay it listens on. Replies and tunnel data travel on queues
//! named after a random correlation or session id.

use crate::model::{CloudIdentity, SessionId};

/// Direction of tunnel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Consumer side towards provider side
    ToProvider,
    /// Provider side towards consumer side
    ToConsumer,
}

/// Queue a cloud's gatekeeper reads discovery polls from.
#[must_use]
pub fn gatekeeper_requests(cloud: &CloudIdentity) -> String {
    format!("gatekeeper.{}.{}.requests", cloud.name, cloud.operator)
}

/// Reply queue of one poll task.
#[must_use]
pub fn gatekeeper_reply(correlation_id: u64) -> String {
    format!("gatekeeper.reply.{correlation_id:016x}")
}

/// Queue a cloud's gateway reads `Open` requests from.
#[must_use]
pub fn gateway_control(cloud: &CloudIdentity) -> String {
    format!("gateway.{}.{}.control", cloud.name, cloud.operator)
}

/// Reply queue of one tunnel handshake.
#[must_use]
pub fn gateway_reply(session_id: &SessionId) -> String {
    format!("gateway.reply.{}", hex::encode(session_id))
}

/// Data queue of one tunnel direction.
#[must_use]
pub fn tunnel_data(session_id: &SessionId, direction: Direction) -> String {
    let suffix = match direction {
        Direction::ToProvider => "to-provider",
        Direction::ToConsumer => "to-consumer",
    };
    format!("gateway.{}.{suffix}", hex::encode(session_id))
}
