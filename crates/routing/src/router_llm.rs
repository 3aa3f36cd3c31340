//! Router-LLM agent selection for broadcast rooms (spec §4.7).
//!
//! The server never forwards the raw LLM key to clients, and the stored key
//! is decrypted only for the duration of this call.

use std::time::Duration;

use agentim_auth::crypto::EncryptionKey;
use agentim_rooms::types::{AgentPrincipal, Router};
use serde::Deserialize;
use tracing::warn;

use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

fn build_prompt(user_message: &str, agents: &[AgentPrincipal]) -> String {
    let roster: Vec<_> = agents
        .iter()
        .map(|a| {
            serde_json::json!({
                "id": a.agent_id,
                "name": a.name,
                "type": a.agent_type,
                "capabilities": a.capabilities,
            })
        })
        .collect();
    format!(
        "You are selecting which agents should respond to a chat message. \
         Respond with a JSON array of agent ids only, e.g. [\"id1\",\"id2\"], \
         or [] if none should respond.\n\nAgents: {}\n\nMessage: {}",
        serde_json::Value::Array(roster),
        user_message
    )
}

/// Decrypt, invoke, and parse the router-LLM's agent selection. A null,
/// empty, malformed, or timed-out response results in "route nowhere"
/// (an empty vec), matching the spec's fail-safe behaviour — callers
/// should not surface this as a hard error to the sender.
pub async fn select_agents(
    router: &Router,
    encryption_key: &EncryptionKey,
    user_message: &str,
    eligible_agents: &[AgentPrincipal],
    timeout: Duration,
) -> Vec<String> {
    match select_agents_inner(router, encryption_key, user_message, eligible_agents, timeout).await
    {
        Ok(ids) => ids,
        Err(e) => {
            warn!(router_id = %router.router_id, error = %e, "router-LLM selection failed, routing nowhere");
            Vec::new()
        },
    }
}

async fn select_agents_inner(
    router: &Router,
    encryption_key: &EncryptionKey,
    user_message: &str,
    eligible_agents: &[AgentPrincipal],
    timeout: Duration,
) -> Result<Vec<String>> {
    let api_key_bytes = encryption_key.decrypt(&router.llm_api_key_encrypted)?;
    let api_key = String::from_utf8(api_key_bytes).map_err(|_| Error::MalformedResponse)?;

    let url = format!(
        "{}/chat/completions",
        router.llm_base_url.trim_end_matches('/')
    );
    agentim_ssrf::check_url(&url).await?;

    let prompt = build_prompt(user_message, eligible_agents);
    let body = serde_json::json!({
        "model": router.llm_model,
        "messages": [{"role": "user", "content": prompt}],
        "temperature": 0,
    });

    let client = reqwest::Client::new();
    let response = tokio::time::timeout(
        timeout,
        client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send(),
    )
    .await
    .map_err(|_| Error::Timeout)?
    .map_err(|e| Error::Message(e.to_string()))?;

    let parsed: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|_| Error::MalformedResponse)?;

    let content = parsed
        .choices
        .first()
        .and_then(|c| c.message.content.as_ref())
        .ok_or(Error::MalformedResponse)?;

    let ids: Vec<String> = serde_json::from_str(content).map_err(|_| Error::MalformedResponse)?;
    let eligible_ids: std::collections::HashSet<_> =
        eligible_agents.iter().map(|a| a.agent_id.as_str()).collect();
    Ok(ids.into_iter().filter(|id| eligible_ids.contains(id.as_str())).collect())
}
