//! Channel naming convention.
//!
//! Personal channels are scoped to one user; conversation channels are shared
//! by every participant currently joined. Names are server-internal and never
//! exposed on the wire.

pub fn user_messages(user_id: &str) -> String {
    format!("user:{user_id}:messages")
}

pub fn user_typings(user_id: &str) -> String {
    format!("user:{user_id}:typings")
}

pub fn conversation_messages(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}:messages")
}

pub fn conversation_typings(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}:typings")
}

/// The two well-known personal channels subscribed on connect.
pub fn personal_channels(user_id: &str) -> [String; 2] {
    [user_messages(user_id), user_typings(user_id)]
}

/// The two channels backing one conversation.
pub fn conversation_channels(conversation_id: &str) -> [String; 2] {
    [
        conversation_messages(conversation_id),
        conversation_typings(conversation_id),
    ]
}
