//! Auth state machine (spec §4.4): arm a timer on connect, verify the first
//! frame, enforce the connection cap, and emit presence broadcasts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agentim_auth::{RevocationStore, TokenStore, authenticate, enforce_connection_limit};
use agentim_protocol::ServerToClientFrame;
use tracing::info;

use crate::broadcast::{broadcast_to_all, broadcast_to_room};
use crate::state::{ClientEntry, ConnectionTables};

pub struct AuthOutcome {
    pub user_id: String,
    pub username: String,
    pub conn_limit_override: Option<u32>,
    pub online_transition: bool,
}

/// Verify a client auth frame's bearer token and enforce the connection
/// cap, without mutating connection state — the caller registers the
/// endpoint only after this succeeds (so a rejected auth never occupies a
/// connection slot).
pub async fn authenticate_client(
    tables: &ConnectionTables,
    tokens: &dyn TokenStore,
    revocations: &dyn RevocationStore,
    token: &str,
    username_lookup: impl FnOnce(&str) -> String,
    default_connection_limit: u32,
) -> Result<AuthOutcome, agentim_auth::Error> {
    let principal = authenticate(tokens, revocations, token).await?;
    let current = tables.user_connection_count(&principal.principal_id) as u32;
    enforce_connection_limit(current, default_connection_limit, principal.connection_limit_override)?;

    Ok(AuthOutcome {
        username: username_lookup(&principal.principal_id),
        online_transition: current == 0,
        user_id: principal.principal_id,
        conn_limit_override: principal.connection_limit_override,
    })
}

/// Register the now-authenticated endpoint and, if this was the
/// principal's first connection, broadcast presence-online to everyone.
pub fn finish_client_auth(
    tables: &Arc<ConnectionTables>,
    endpoint: String,
    outcome: AuthOutcome,
    sender: tokio::sync::mpsc::UnboundedSender<String>,
) {
    let entry = ClientEntry {
        user_id: outcome.user_id.clone(),
        username: outcome.username.clone(),
        joined_rooms: Default::default(),
        conn_limit_override: outcome.conn_limit_override,
        sender,
    };
    let first = tables.register_client(endpoint, entry);
    info!(user_id = %outcome.user_id, "client authenticated");
    if first {
        broadcast_to_all(
            tables,
            &ServerToClientFrame::Presence {
                user_id: outcome.user_id,
                username: outcome.username,
                online: true,
            },
        );
    }
}

/// Every room the closed endpoint had joined gets a typing-clear broadcast,
/// and presence-offline goes out if this was the principal's last connection
/// (spec §3 client-close lifecycle).
pub fn handle_client_disconnect(tables: &Arc<ConnectionTables>, endpoint: &str) {
    let Some((entry, last)) = tables.remove_client(endpoint) else { return };

    for room_id in &entry.joined_rooms {
        broadcast_to_room(
            tables,
            room_id,
            &ServerToClientFrame::Typing {
                room_id: room_id.clone(),
                user_id: entry.user_id.clone(),
                username: entry.username.clone(),
                is_typing: false,
            },
            None,
        );
    }

    if last {
        broadcast_to_all(
            tables,
            &ServerToClientFrame::Presence {
                user_id: entry.user_id,
                username: entry.username,
                online: false,
            },
        );
    }
}

/// Arms the §4.4 auth timer around a future that resolves once the first
/// frame has been read and validated. On timeout the caller should close
/// the socket with code 4001.
pub async fn with_auth_timeout<F, T>(timeout: Duration, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut).await.ok()
}
