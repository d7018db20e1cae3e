use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One reconstructed turn of the lead conversation, already sanitized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: ChatRole,
    pub text: String,
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: ChatRole::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, text: text.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatRole, TranscriptEntry};

    #[test]
    fn constructors_tag_roles() {
        assert_eq!(TranscriptEntry::user("hola").role, ChatRole::User);
        assert_eq!(TranscriptEntry::assistant("buenas").role, ChatRole::Assistant);
        assert_eq!(ChatRole::User.as_str(), "user");
        assert_eq!(ChatRole::Assistant.as_str(), "assistant");
    }
}
