use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::{ApiError, AppState, resolve_request, with_session_cookie};
use crate::access::AccessTier;
use crate::error::AccessError;
use crate::llm::ChatMessage;

pub async fn access_status(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    let verdict = state.gate.has_access(&resolved).await?;

    Ok(with_session_cookie(
        &resolved,
        json!({
            "allowed": verdict.allowed,
            "access_type": verdict.tier,
            "free_access": verdict.quota,
        }),
    ))
}

#[derive(Deserialize)]
pub struct ChatRequest {
    message: String,
    model: String,
    conversation_id: Option<String>,
    project_id: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    let verdict = state.gate.require_access(&resolved).await?;

    if body.message.trim().is_empty() {
        return Err(AccessError::Validation("Message is required".to_string()).into());
    }

    let conversation = match &body.conversation_id {
        Some(id) => state.conversations.get(&resolved.identity, id).await?,
        None => {
            state
                .conversations
                .create(
                    &resolved.identity,
                    &resolved.ip,
                    &title_from(&body.message),
                    &body.model,
                    body.project_id.as_deref(),
                )
                .await?
        }
    };

    // Pinned context rides ahead of the transcript.
    let attached = state.context.conversation_context(&conversation.id).await?;
    let mut history: Vec<ChatMessage> = Vec::new();
    if !attached.is_empty() {
        let mut preamble = String::from("Reference context:\n");
        for item in &attached {
            preamble.push_str(&format!("\n## {}\n{}\n", item.name, item.content_text));
        }
        history.push(ChatMessage {
            role: "user".to_string(),
            content: preamble,
        });
    }
    history.extend(
        state
            .conversations
            .messages(&conversation.id)
            .await?
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            }),
    );
    history.push(ChatMessage {
        role: "user".to_string(),
        content: body.message.clone(),
    });

    let reply = state.llm.complete(&body.model, &history).await?;

    state
        .conversations
        .append_message(&conversation.id, "user", &body.message, &body.model, 0)
        .await?;
    let assistant = state
        .conversations
        .append_message(
            &conversation.id,
            "assistant",
            &reply.content,
            &body.model,
            reply.token_count,
        )
        .await?;

    for item in &attached {
        state
            .context
            .log_usage(
                &conversation.id,
                &assistant.id,
                &item.item_id,
                "input",
                item.token_count,
            )
            .await?;
    }

    // Metered once per logical action, after it completed. A persistence
    // failure here fails the request; it must not look like an unmetered
    // success.
    let free_access = if verdict.tier == AccessTier::FreeTier {
        Some(
            state
                .gate
                .quota()
                .log_query(
                    &resolved.identity,
                    &resolved.ip,
                    &resolved.user_agent,
                    &body.model,
                )
                .await?,
        )
    } else {
        None
    };

    Ok(with_session_cookie(
        &resolved,
        json!({
            "conversation_id": conversation.id,
            "message": assistant,
            "access_type": verdict.tier,
            "free_access": free_access,
        }),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    let verdict = state.gate.require_access(&resolved).await?;

    let conversations = state.conversations.list(&resolved.identity).await?;
    Ok(with_session_cookie(
        &resolved,
        json!({
            "conversations": conversations,
            "access_type": verdict.tier,
        }),
    ))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let conversation = state.conversations.get(&resolved.identity, &id).await?;
    let messages = state.conversations.messages(&conversation.id).await?;
    Ok(with_session_cookie(
        &resolved,
        json!({
            "conversation": conversation,
            "messages": messages,
        }),
    ))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    state.conversations.delete(&resolved.identity, &id).await?;
    Ok(with_session_cookie(&resolved, json!({ "success": true })))
}

pub async fn project_conversations(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let conversations = state
        .conversations
        .list_by_project(&resolved.identity, &project_id)
        .await?;
    Ok(with_session_cookie(
        &resolved,
        json!({ "project_id": project_id, "conversations": conversations }),
    ))
}

fn title_from(message: &str) -> String {
    let trimmed = message.trim();
    let title: String = trimmed.chars().take(80).collect();
    if title.is_empty() {
        "New conversation".to_string()
    } else {
        title
    }
}
