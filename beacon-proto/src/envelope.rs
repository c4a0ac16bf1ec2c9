//! JSON wire envelopes for the signaling relay.
//!
//! Every WebSocket frame is one UTF-8 text frame holding a single JSON
//! object, internally tagged by `type`. [`ClientEnvelope`] covers
//! client -> server frames, [`ServerEnvelope`] server -> client frames.
//! Negotiation payloads and user-info blobs are opaque
//! [`serde_json::Value`]s: the relay routes on metadata only and never
//! interprets message bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length for a user id in characters.
pub const MAX_USER_ID_LEN: usize = 50;

/// The `type` tags the relay recognizes from clients.
///
/// A frame whose tag is outside this set is an unrecognized type (ignored
/// by the relay), as opposed to a malformed frame of a known type (which
/// earns an error reply).
const CLIENT_TYPES: &[&str] = &[
    "register",
    "offer",
    "answer",
    "ice-candidate",
    "message",
    "contact-request",
    "contact-accepted",
    "get-online-users",
    "ping",
];

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Frames sent from a client to the relay.
///
/// All variants serialize as `{"type": "<kebab-case-tag>", ...}` with
/// camelCase field names. Unknown extra fields are tolerated and ignored,
/// so a client-supplied `fromUserId` can never influence routing — sender
/// identity is always attached server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEnvelope {
    /// Bind a user id to this connection. Must precede every other frame.
    Register {
        /// Externally supplied identity, non-empty and at most
        /// [`MAX_USER_ID_LEN`] characters.
        user_id: String,
        /// Opaque user-info blob, forwarded verbatim in presence events
        /// and signaling forwards.
        #[serde(default)]
        user_info: Option<Value>,
    },
    /// Session-description offer for the target peer.
    Offer {
        target_user_id: String,
        payload: Value,
    },
    /// Session-description answer for the target peer.
    Answer {
        target_user_id: String,
        payload: Value,
    },
    /// ICE candidate for the target peer.
    IceCandidate {
        target_user_id: String,
        payload: Value,
    },
    /// Opaque application envelope. Dropped (not queued) if the target
    /// is offline.
    Message {
        target_user_id: String,
        message_data: Value,
    },
    /// Contact request for the target peer.
    ContactRequest {
        target_user_id: String,
        payload: Value,
    },
    /// Contact acceptance notification for the target peer.
    ContactAccepted {
        target_user_id: String,
        payload: Value,
    },
    /// Ask for the current roster (excluding the requester).
    GetOnlineUsers,
    /// Heartbeat; refreshes the session's last-seen timestamp.
    Ping,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEnvelope {
    /// Welcome frame sent once per connection, carrying the
    /// server-assigned connection id.
    Connected { client_id: String, message: String },
    /// Registration acknowledgment with the current roster, which never
    /// contains the registrant itself.
    Registered {
        user_id: String,
        online_users: Vec<OnlineUser>,
    },
    /// Forwarded session-description offer.
    Offer {
        from_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_info: Option<Value>,
        payload: Value,
    },
    /// Forwarded session-description answer.
    Answer {
        from_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_info: Option<Value>,
        payload: Value,
    },
    /// Forwarded ICE candidate.
    IceCandidate {
        from_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_info: Option<Value>,
        payload: Value,
    },
    /// Forwarded application envelope.
    Message {
        from_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_info: Option<Value>,
        message_data: Value,
    },
    /// Forwarded contact request.
    ContactRequest {
        from_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_info: Option<Value>,
        payload: Value,
    },
    /// Forwarded contact acceptance.
    ContactAccepted {
        from_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_info: Option<Value>,
        payload: Value,
    },
    /// Roster reply to `get-online-users`, excluding the requester.
    OnlineUsers { users: Vec<OnlineUser> },
    /// Presence transition broadcast to every other registered connection.
    UserStatus {
        user_id: String,
        is_online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_info: Option<Value>,
    },
    /// Heartbeat reply; `timestamp` is unix milliseconds.
    Pong { timestamp: u64 },
    /// Error report. The connection stays open.
    Error { message: String },
}

/// One roster entry: a registered identity and its opaque info blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Error classifying an inbound frame that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Frame is not valid JSON, not an object, lacks a `type`, or is a
    /// known type with missing or ill-typed fields.
    #[error("invalid message format: {0}")]
    Malformed(String),
    /// Frame is a well-formed object whose `type` is not recognized.
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
}

/// Decodes a client frame, classifying failures for the router.
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] for frames that deserve an error
/// reply, [`DecodeError::UnknownType`] for frames the relay ignores.
pub fn decode(text: &str) -> Result<ClientEnvelope, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Some(tag) = value.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::Malformed(
            "missing or non-string `type` field".to_string(),
        ));
    };
    if !CLIENT_TYPES.contains(&tag) {
        return Err(DecodeError::UnknownType(tag.to_string()));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Encodes a server frame to its JSON text representation.
///
/// # Errors
///
/// Returns the underlying `serde_json` error; cannot fail for the types
/// defined here in practice.
pub fn encode(envelope: &ServerEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

// ---------------------------------------------------------------------------
// User id validation
// ---------------------------------------------------------------------------

/// Rejection reason for a registration user id.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UserIdError {
    /// The id is the empty string.
    #[error("user ID must not be empty")]
    Empty,
    /// The id exceeds [`MAX_USER_ID_LEN`] characters.
    #[error("user ID exceeds {MAX_USER_ID_LEN} characters")]
    TooLong,
}

/// Validates a registration user id: non-empty, at most
/// [`MAX_USER_ID_LEN`] characters. The id is taken as-is — no trimming or
/// sanitization, since it is an opaque identifier chosen by the client.
///
/// # Errors
///
/// Returns [`UserIdError`] naming the violated bound.
pub fn validate_user_id(id: &str) -> Result<(), UserIdError> {
    if id.is_empty() {
        return Err(UserIdError::Empty);
    }
    if id.chars().count() > MAX_USER_ID_LEN {
        return Err(UserIdError::TooLong);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
