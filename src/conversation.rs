//! In-memory conversation history.
//!
//! Conversations are append-only apart from their title. The first user
//! message names an untitled conversation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use knowledge_engine_core::llm::{ChatMessage, Role};
use knowledge_engine_core::{EngineError, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::chat::SourceCitation;

pub const DEFAULT_TITLE: &str = "New conversation";

const AUTO_TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub sources: Vec<SourceCitation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, title: Option<&str>) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };
        self.write()
            .insert(conversation.id.clone(), conversation.clone());
        conversation
    }

    pub fn append(
        &self,
        id: &str,
        role: Role,
        content: &str,
        sources: Vec<SourceCitation>,
    ) -> Result<()> {
        let mut guard = self.write();
        let conversation = guard
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))?;
        let now = Utc::now();
        if role == Role::User && conversation.title == DEFAULT_TITLE {
            if let Some(title) = auto_title(content) {
                conversation.title = title;
            }
        }
        conversation.messages.push(ConversationMessage {
            role,
            content: content.to_string(),
            sources,
            created_at: now,
        });
        conversation.updated_at = now;
        Ok(())
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::InvalidInput(
                "conversation title must not be empty".to_string(),
            ));
        }
        let mut guard = self.write();
        let conversation = guard
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))?;
        conversation.title = title.to_string();
        conversation.updated_at = Utc::now();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.read().get(id).cloned()
    }

    /// Most recently updated first.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .read()
            .values()
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                created_at: c.created_at,
                updated_at: c.updated_at,
                message_count: c.messages.len(),
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn delete(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    /// The last `turns` messages as prompt history, oldest first.
    pub fn history(&self, id: &str, turns: usize) -> Result<Vec<ChatMessage>> {
        let guard = self.read();
        let conversation = guard
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))?;
        let skip = conversation.messages.len().saturating_sub(turns);
        Ok(conversation.messages[skip..]
            .iter()
            .map(|m| ChatMessage::new(m.role, m.content.clone()))
            .collect())
    }
}

fn auto_title(message: &str) -> Option<String> {
    let line = message.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(match line.char_indices().nth(AUTO_TITLE_CHARS) {
        Some((i, _)) => format!("{}...", line[..i].trim_end()),
        None => line.to_string(),
    })
}
