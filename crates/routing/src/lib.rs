//! Routing engine (spec §4.7): the mention-vs-broadcast decision matrix and
//! router-LLM agent selection for broadcast rooms.

pub mod error;
pub mod router_llm;

use agentim_rooms::types::{AgentPrincipal, ConnectionType, Room, Router};

pub use error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Direct,
    Broadcast,
    None,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub mode: RoutingMode,
    pub target_agent_ids: Vec<String>,
}

impl RoutingDecision {
    fn none() -> Self {
        Self { mode: RoutingMode::None, target_agent_ids: Vec::new() }
    }
}

/// Implements the decision table in spec §4.7. `router_selection`, when
/// invoked, performs the router-LLM call and returns the chosen agent ids
/// (already filtered to eligible agents) — callers pass a closure so this
/// function stays synchronous and independently testable against the four
/// precondition rows without needing network access.
pub fn route_message(
    room: &Room,
    mentioned_agent_ids: &[String],
    router: Option<&Router>,
    eligible_agents: &[AgentPrincipal],
) -> RoutingDecision {
    if !mentioned_agent_ids.is_empty() {
        return RoutingDecision {
            mode: RoutingMode::Direct,
            target_agent_ids: mentioned_agent_ids.to_vec(),
        };
    }

    if room.broadcast_mode {
        let has_eligible_non_api_agent = eligible_agents
            .iter()
            .any(|a| a.connection_type != ConnectionType::Api);
        if router.is_some() && has_eligible_non_api_agent {
            // Caller resolves the actual LLM-chosen subset separately via
            // `router_llm::select_agents`; the matrix only determines mode
            // here, since the LLM call is async and fallible.
            return RoutingDecision { mode: RoutingMode::Broadcast, target_agent_ids: Vec::new() };
        }
        return RoutingDecision::none();
    }

    RoutingDecision::none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentim_rooms::types::Visibility;

    fn room(broadcast: bool, router_ref: Option<&str>) -> Room {
        Room {
            room_id: "r1".into(),
            created_by: "owner".into(),
            broadcast_mode: broadcast,
            system_prompt: None,
            router_ref: router_ref.map(String::from),
            members: Vec::new(),
        }
    }

    fn router() -> Router {
        Router {
            router_id: "router1".into(),
            name: "default".into(),
            scope: agentim_rooms::types::RouterScope::Global,
            llm_base_url: "https://api.openai.com/v1".into(),
            llm_api_key_encrypted: vec![],
            llm_model: "gpt-4o-mini".into(),
            max_chain_depth: 3,
            rate_limit_window_secs: 60,
            rate_limit_max: 10,
            visibility: agentim_rooms::types::RouterVisibility::All,
            visibility_user_ids: vec![],
        }
    }

    fn agent(connection_type: ConnectionType) -> AgentPrincipal {
        AgentPrincipal {
            agent_id: "a1".into(),
            agent_type: "chat".into(),
            name: "alpha".into(),
            working_directory: None,
            owner_user_id: "owner".into(),
            connection_type,
            capabilities: vec![],
            visibility: Visibility::Shared,
        }
    }

    #[test]
    fn mention_wins_regardless_of_room_mode() {
        let decision = route_message(&room(true, Some("router1")), &["alpha-id".to_string()], Some(&router()), &[]);
        assert_eq!(decision.mode, RoutingMode::Direct);
        assert_eq!(decision.target_agent_ids, vec!["alpha-id".to_string()]);
    }

    #[test]
    fn broadcast_with_router_and_eligible_agent_routes_broadcast() {
        let decision = route_message(
            &room(true, Some("router1")),
            &[],
            Some(&router()),
            &[agent(ConnectionType::Cli)],
        );
        assert_eq!(decision.mode, RoutingMode::Broadcast);
    }

    #[test]
    fn broadcast_without_router_routes_nowhere() {
        let decision = route_message(&room(true, None), &[], None, &[agent(ConnectionType::Cli)]);
        assert_eq!(decision.mode, RoutingMode::None);
    }

    #[test]
    fn broadcast_with_only_api_agents_routes_nowhere() {
        let decision = route_message(
            &room(true, Some("router1")),
            &[],
            Some(&router()),
            &[agent(ConnectionType::Api)],
        );
        assert_eq!(decision.mode, RoutingMode::None);
    }

    #[test]
    fn non_broadcast_room_without_mentions_routes_nowhere() {
        let decision = route_message(&room(false, None), &[], None, &[agent(ConnectionType::Cli)]);
        assert_eq!(decision.mode, RoutingMode::None);
    }
}
