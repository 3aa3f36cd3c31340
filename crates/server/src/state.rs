//! Server connection tables (spec §4.3): process-local maps from endpoint
//! to connection state, plus the presence/room/agent-routing indexes built
//! on top of them. Mutations to a given map are serialised by `DashMap`'s
//! per-shard locking; no cross-table lock is required for reads.

use std::collections::HashSet;
use std::sync::Arc;

use agentim_rooms::types::DeviceInfo;
use dashmap::DashMap;
use tokio::sync::mpsc;

pub type Endpoint = String;

/// Per-connection state for a `/ws/client` socket.
pub struct ClientEntry {
    pub user_id: String,
    pub username: String,
    pub joined_rooms: HashSet<String>,
    pub conn_limit_override: Option<u32>,
    pub sender: mpsc::UnboundedSender<String>,
}

/// Per-connection state for a `/ws/gateway` socket.
pub struct GatewayEntry {
    pub gateway_id: String,
    pub owner_user_id: String,
    pub device_info: DeviceInfo,
    pub agent_ids: HashSet<String>,
    pub sender: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct ConnectionTables {
    pub clients: DashMap<Endpoint, ClientEntry>,
    pub gateways: DashMap<Endpoint, GatewayEntry>,
    /// Presence index: userId → connected client endpoints.
    user_endpoints: DashMap<String, HashSet<Endpoint>>,
    /// Broadcast fan-out index: roomId → connected client endpoints.
    room_endpoints: DashMap<String, HashSet<Endpoint>>,
    /// Routing index: agentId → gateway endpoint. "At most one gateway is
    /// authoritative, latest registration wins" (invariant I3).
    agent_gateway: DashMap<String, Endpoint>,
}

impl ConnectionTables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of currently connected endpoints for `user_id`, used to
    /// enforce the per-user connection cap (§4.3/§4.4).
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.user_endpoints.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Register an authenticated client endpoint. Returns `true` if this is
    /// the principal's first endpoint (the caller should broadcast
    /// presence-online).
    pub fn register_client(&self, endpoint: Endpoint, entry: ClientEntry) -> bool {
        let user_id = entry.user_id.clone();
        self.clients.insert(endpoint.clone(), entry);
        let mut endpoints = self.user_endpoints.entry(user_id).or_default();
        endpoints.insert(endpoint);
        endpoints.len() == 1
    }

    /// Remove a client endpoint. Returns `true` if this was the principal's
    /// last endpoint (the caller should broadcast presence-offline).
    pub fn remove_client(&self, endpoint: &str) -> Option<(ClientEntry, bool)> {
        let (_, entry) = self.clients.remove(endpoint)?;
        for room_id in &entry.joined_rooms {
            if let Some(mut members) = self.room_endpoints.get_mut(room_id) {
                members.remove(endpoint);
            }
        }
        let last = match self.user_endpoints.get_mut(&entry.user_id) {
            Some(mut endpoints) => {
                endpoints.remove(endpoint);
                endpoints.is_empty()
            },
            None => true,
        };
        if last {
            self.user_endpoints.remove(&entry.user_id);
        }
        Some((entry, last))
    }

    pub fn join_room(&self, endpoint: &str, room_id: &str) {
        if let Some(mut client) = self.clients.get_mut(endpoint) {
            client.joined_rooms.insert(room_id.to_string());
        }
        self.room_endpoints.entry(room_id.to_string()).or_default().insert(endpoint.to_string());
    }

    pub fn leave_room(&self, endpoint: &str, room_id: &str) {
        if let Some(mut client) = self.clients.get_mut(endpoint) {
            client.joined_rooms.remove(room_id);
        }
        if let Some(mut members) = self.room_endpoints.get_mut(room_id) {
            members.remove(endpoint);
        }
    }

    pub fn room_members(&self, room_id: &str) -> Vec<Endpoint> {
        self.room_endpoints.get(room_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Register a gateway endpoint and its declared agent ids. Later
    /// registrations of the same agent id win over earlier ones (I3).
    pub fn register_gateway(&self, endpoint: Endpoint, entry: GatewayEntry) {
        for agent_id in &entry.agent_ids {
            self.agent_gateway.insert(agent_id.clone(), endpoint.clone());
        }
        self.gateways.insert(endpoint, entry);
    }

    pub fn remove_gateway(&self, endpoint: &str) -> Option<GatewayEntry> {
        let (_, entry) = self.gateways.remove(endpoint)?;
        for agent_id in &entry.agent_ids {
            // Only clear the routing entry if it still points at this
            // gateway — a newer registration may have already won it.
            if let Some(current) = self.agent_gateway.get(agent_id)
                && current.as_str() == endpoint
            {
                drop(current);
                self.agent_gateway.remove(agent_id);
            }
        }
        Some(entry)
    }

    pub fn register_agent(&self, endpoint: &str, agent_id: &str) {
        self.agent_gateway.insert(agent_id.to_string(), endpoint.to_string());
        if let Some(mut gateway) = self.gateways.get_mut(endpoint) {
            gateway.agent_ids.insert(agent_id.to_string());
        }
    }

    pub fn gateway_for_agent(&self, agent_id: &str) -> Option<Endpoint> {
        self.agent_gateway.get(agent_id).map(|e| e.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
