use serde::{Deserialize, Serialize};

/// One turn of a conversation. Role is an open string; "user", "assistant"
/// and "system" are the conventional values but nothing is enforced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}
