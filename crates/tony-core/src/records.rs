use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_CATEGORY: &str = "general";
pub const USER_PROFILE_CATEGORY: &str = "user_profile";
pub const CONVERSATION_TOPICS_CATEGORY: &str = "conversation_topics";
pub const USER_PROFILE_PREFIX: &str = "user_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Human,
    Ai,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Human => "human",
            MessageType::Ai => "ai",
            MessageType::System => "system",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "human" | "user" => Ok(MessageType::Human),
            "ai" | "assistant" => Ok(MessageType::Ai),
            "system" => Ok(MessageType::System),
            other => Err(format!("Unknown message type: {other}")),
        }
    }
}

/// A single conversation turn as exchanged with the calling agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_type: MessageType,
    pub content: String,
}

impl ChatMessage {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageType::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(MessageType::Ai, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageType::System, content)
    }

    pub fn is_human(&self) -> bool {
        self.message_type == MessageType::Human
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodicRecord {
    pub id: i64,
    pub session_id: String,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_to_remote: bool,
}

impl EpisodicRecord {
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::new(self.message_type, self.content.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticRecord {
    pub id: i64,
    pub session_id: String,
    pub concept: String,
    pub knowledge: String,
    pub category: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_to_remote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProceduralRecord {
    pub id: i64,
    pub session_id: String,
    pub procedure_name: String,
    pub steps: Vec<String>,
    pub context: String,
    pub success_rate: f64,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub synced_to_remote: bool,
}

impl ProceduralRecord {
    /// Folds one more outcome into the running success average.
    pub fn with_outcome(&self, success: bool) -> (f64, i64) {
        running_average(self.success_rate, self.usage_count, success)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub last_activity: DateTime<Utc>,
    pub total_messages: i64,
    pub compressed_backup: Option<Vec<u8>>,
    pub backup_timestamp: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    pub fn has_backup(&self) -> bool {
        self.compressed_backup
            .as_ref()
            .is_some_and(|blob| !blob.is_empty())
    }
}

/// Decoded contents of a session backup blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub episodic: Vec<EpisodicRecord>,
    pub semantic: Vec<SemanticRecord>,
    pub procedural: Vec<ProceduralRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Episodic,
    Semantic,
    Procedural,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Episodic => "episodic",
            RecordKind::Semantic => "semantic",
            RecordKind::Procedural => "procedural",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn running_average(rate: f64, count: i64, success: bool) -> (f64, i64) {
    let count = count.max(1);
    let outcome = if success { 1.0 } else { 0.0 };
    let next_count = count + 1;
    let next_rate = (rate * count as f64 + outcome) / next_count as f64;
    (clamp_unit(next_rate), next_count)
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
