use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    inference::{InferenceError, OllamaClient},
    model::{ChatMessage, Conversation},
    AppState,
};

const GREETING: &str = "How can I help you today? 🚀";

/// JSON frame sent to the browser over the chat websocket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    Notice { message: String },
    Fragment { content: String },
    Complete { content: String },
    Error { reason: &'static str, message: String },
}

impl ServerEvent {
    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }

    pub fn error(err: &InferenceError) -> Self {
        Self::Error {
            reason: err.kind(),
            message: err.to_string(),
        }
    }

    fn to_message(&self) -> Message {
        Message::Text(serde_json::to_string(self).expect("server event serializes"))
    }
}

// This function deals with a single websocket connection, i.e., a single
// chat session: the conversation lives exactly as long as the socket and is
// never shared across connections.
pub async fn chat_websocket(stream: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = stream.split();
    let mut conversation = Conversation::new();

    if sender
        .send(ServerEvent::notice(GREETING).to_message())
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(Message::Text(text))) = receiver.next().await {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        if let Some(cmd) = text.strip_prefix('!') {
            let event = dispatch_cmd(cmd, &mut conversation, &state.client).await;
            if sender.send(event.to_message()).await.is_err() {
                return;
            }
            continue;
        }

        // The next frame is not read until the turn has completed or failed,
        // so a session never has two inference requests in flight.
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let turn = run_turn(&mut conversation, &state.client, text, events_tx);
        let forward = async {
            while let Some(event) = events_rx.recv().await {
                if sender.send(event.to_message()).await.is_err() {
                    break;
                }
            }
        };
        tokio::join!(turn, forward);
    }

    tracing::info!("chat session closed with {} stored messages", conversation.len());
}

/// Runs one prompt/response exchange: appends the user message, streams the
/// reply as [`ServerEvent`]s, and appends the assembled assistant message once
/// the stream completes. On failure the user message is kept and no assistant
/// entry is stored, never a partial one.
pub async fn run_turn(
    conversation: &mut Conversation,
    client: &OllamaClient,
    prompt: &str,
    events: mpsc::Sender<ServerEvent>,
) {
    conversation.append(ChatMessage::user(prompt));

    let mut fragments = match client.send(conversation.messages()).await {
        Ok(fragments) => fragments,
        Err(err) => {
            tracing::error!("inference request failed: {err}");
            let _ = events.send(ServerEvent::error(&err)).await;
            return;
        }
    };

    let mut reply = String::new();
    while let Some(fragment) = fragments.next_fragment().await {
        match fragment {
            Ok(content) => {
                reply.push_str(&content);
                if events
                    .send(ServerEvent::Fragment { content })
                    .await
                    .is_err()
                {
                    // Client is gone; the partial reply goes with it.
                    return;
                }
            }
            Err(err) => {
                tracing::error!("inference stream failed: {err}");
                let _ = events.send(ServerEvent::error(&err)).await;
                return;
            }
        }
    }

    conversation.append(ChatMessage::assistant(reply.clone()));
    let _ = events.send(ServerEvent::Complete { content: reply }).await;
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChatCommand {
    ClearHistory,
    ListModels,
    ShowParams,
    Unknown(String),
}

pub fn process_cmd(text: &str) -> ChatCommand {
    match text.trim().to_uppercase().as_str() {
        "CLEAR" => ChatCommand::ClearHistory,
        "MODELS" => ChatCommand::ListModels,
        "PARAMS" => ChatCommand::ShowParams,
        _ => ChatCommand::Unknown(text.trim().to_string()),
    }
}

async fn dispatch_cmd(
    text: &str,
    conversation: &mut Conversation,
    client: &OllamaClient,
) -> ServerEvent {
    match process_cmd(text) {
        ChatCommand::ClearHistory => {
            conversation.clear();
            ServerEvent::notice("🧹 Chat history cleared")
        }
        ChatCommand::ListModels => match client.list_models().await {
            Ok(models) => ServerEvent::notice(format!("🤖 Installed models: {}", models.join(", "))),
            Err(err) => ServerEvent::error(&err),
        },
        ChatCommand::ShowParams => ServerEvent::notice(format!(
            "🤖 Model parameters: {}",
            serde_json::to_string(client.options()).expect("options serialize")
        )),
        ChatCommand::Unknown(cmd) => ServerEvent::notice(format!("❓ Unknown command: !{cmd}")),
    }
}
