use serde::{Deserialize, Serialize};

/// Frames sent from client to server.
///
/// The first frame on every connection must be `identify`; everything else is
/// rejected until the user is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "identify")]
    Identify {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "online_connections")]
    OnlineConnections,
    #[serde(rename = "join_conversation")]
    JoinConversation {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    #[serde(rename = "leave_conversation")]
    LeaveConversation {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
}

/// Frames originated by the server itself.
///
/// Event envelopes (`new_message`, `chat_message`, `new_conversation`,
/// `typing`) are not modeled here: they come off the broker as opaque JSON
/// and pass through the fanout path unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "online_connections")]
    OnlineConnections { data: Vec<String> },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn online_connections(users: Vec<String>) -> Self {
        Self::OnlineConnections { data: users }
    }
}
