//! Broadcast primitives (spec §4.3): best-effort fan-out to clients and
//! gateways. A failed send logs and moves on — it never aborts the rest of
//! the fan-out.

use agentim_protocol::{ServerToClientFrame, ServerToGatewayFrame};
use tracing::{debug, warn};

use crate::state::ConnectionTables;

fn serialise_to_client(frame: &ServerToClientFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "failed to serialise server-to-client frame");
            None
        },
    }
}

fn serialise_to_gateway(frame: &ServerToGatewayFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "failed to serialise server-to-gateway frame");
            None
        },
    }
}

pub fn send_to_client(tables: &ConnectionTables, endpoint: &str, frame: &ServerToClientFrame) {
    let Some(json) = serialise_to_client(frame) else { return };
    let Some(client) = tables.clients.get(endpoint) else {
        debug!(endpoint, "send_to_client: endpoint not connected");
        return;
    };
    if client.sender.send(json).is_err() {
        warn!(endpoint, "send_to_client: write half closed");
    }
}

pub fn send_to_gateway(tables: &ConnectionTables, agent_id: &str, frame: &ServerToGatewayFrame) {
    let Some(json) = serialise_to_gateway(frame) else { return };
    let Some(endpoint) = tables.gateway_for_agent(agent_id) else {
        debug!(agent_id, "send_to_gateway: no gateway registered for agent");
        return;
    };
    let Some(gateway) = tables.gateways.get(&endpoint) else {
        debug!(agent_id, endpoint, "send_to_gateway: gateway endpoint vanished");
        return;
    };
    if gateway.sender.send(json).is_err() {
        warn!(agent_id, endpoint, "send_to_gateway: write half closed");
    }
}

/// Broadcast to every client currently joined to `room_id`, optionally
/// excluding one endpoint (the sender, when it should not see its own echo).
pub fn broadcast_to_room(
    tables: &ConnectionTables,
    room_id: &str,
    frame: &ServerToClientFrame,
    exclude: Option<&str>,
) {
    let Some(json) = serialise_to_client(frame) else { return };
    let members = tables.room_members(room_id);
    debug!(room_id, count = members.len(), "broadcasting to room");
    for endpoint in members {
        if exclude == Some(endpoint.as_str()) {
            continue;
        }
        if let Some(client) = tables.clients.get(&endpoint)
            && client.sender.send(json.clone()).is_err()
        {
            warn!(endpoint, "broadcast_to_room: write half closed");
        }
    }
}

pub fn broadcast_to_all(tables: &ConnectionTables, frame: &ServerToClientFrame) {
    let Some(json) = serialise_to_client(frame) else { return };
    for client in tables.clients.iter() {
        if client.sender.send(json.clone()).is_err() {
            warn!(endpoint = client.key().as_str(), "broadcast_to_all: write half closed");
        }
    }
}
