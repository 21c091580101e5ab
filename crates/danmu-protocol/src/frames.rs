//! Frame types for the danmu protocol.
//!
//! Clients send a [`ClientFrame`] as a JSON text message. The relay answers
//! with [`Envelope`]s, tagged by a `type` field so receivers can tell a
//! viewer notice from a danmu without inspecting the text.

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Envelope::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const MALFORMED: u16 = 4000;
    /// The frame decoded but its fields failed validation.
    pub const INVALID: u16 = 4001;
    /// The credential was missing, expired or did not resolve to a user.
    pub const UNAUTHENTICATED: u16 = 4010;
    /// The danmu could not be stored and was not broadcast.
    pub const STORAGE_UNAVAILABLE: u16 = 5000;
}

/// How a danmu is drawn over the video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum DisplayMode {
    /// Scrolls across the screen.
    Scroll = 1,
    /// Pinned to the top.
    Top = 2,
    /// Pinned to the bottom.
    Bottom = 3,
}

impl From<DisplayMode> for u8 {
    fn from(mode: DisplayMode) -> u8 {
        mode as u8
    }
}

impl TryFrom<u8> for DisplayMode {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DisplayMode::Scroll),
            2 => Ok(DisplayMode::Top),
            3 => Ok(DisplayMode::Bottom),
            _ => Err("Invalid display mode"),
        }
    }
}

/// Visibility flag of a stored danmu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Visibility {
    /// Hidden by moderation.
    Hidden = 0,
    /// Shown to viewers. Every accepted danmu starts here.
    Visible = 1,
}

impl From<Visibility> for u8 {
    fn from(v: Visibility) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for Visibility {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Visibility::Hidden),
            1 => Ok(Visibility::Visible),
            _ => Err("Invalid visibility"),
        }
    }
}

/// A frame sent by a client to post a danmu.
///
/// The token is optional at the wire level: a missing token is an
/// authentication failure, not a decoding failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Bearer credential, `"Bearer <jwt>"`.
    #[serde(default)]
    pub token: Option<String>,
    /// The danmu itself.
    pub data: DanmuData,
}

/// Danmu fields as submitted by a client, before validation.
///
/// Numeric fields are kept wide so out-of-range values reach validation
/// instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DanmuData {
    /// Danmu text.
    pub content: String,
    /// Requested font size.
    pub fontsize: i64,
    /// Requested [`DisplayMode`] value.
    pub mode: i64,
    /// Requested text color.
    pub color: String,
    /// Offset into the video, in seconds.
    pub time_point: f64,
}

/// An accepted danmu as broadcast to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DanmuRecord {
    /// Id assigned by storage.
    pub id: u64,
    /// Room the danmu belongs to.
    pub room_id: String,
    /// Id of the sender.
    pub author_id: u64,
    /// Danmu text.
    pub content: String,
    /// Font size in pixels.
    pub fontsize: u32,
    /// Where the danmu is drawn.
    pub mode: DisplayMode,
    /// `#RGB` or `#RRGGBB`.
    pub color: String,
    /// Offset into the video, in seconds.
    pub time_point: f64,
    /// Moderation status.
    pub status: Visibility,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
}

/// A frame sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// System notice, such as the current viewer count.
    Notice {
        /// Human-readable text.
        text: String,
        /// Viewer count, present on membership notices.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewers: Option<usize>,
    },

    /// An accepted danmu.
    Message(DanmuRecord),

    /// Rejection sent only to the offending connection.
    Error {
        /// One of [`codes`].
        code: u16,
        /// Human-readable reason.
        message: String,
    },
}

impl Envelope {
    /// Name of the `type` tag this envelope serializes with.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Notice { .. } => "notice",
            Envelope::Message(_) => "message",
            Envelope::Error { .. } => "error",
        }
    }

    /// Create a plain notice.
    #[must_use]
    pub fn notice(text: impl Into<String>) -> Self {
        Envelope::Notice {
            text: text.into(),
            viewers: None,
        }
    }

    /// Create the viewer-count notice sent on join and leave.
    #[must_use]
    pub fn viewers(count: usize) -> Self {
        Envelope::Notice {
            text: format!("current viewers: {count}"),
            viewers: Some(count),
        }
    }

    /// Create a message envelope.
    #[must_use]
    pub fn message(record: DanmuRecord) -> Self {
        Envelope::Message(record)
    }

    /// Create an error envelope.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Envelope::Error {
            code,
            message: message.into(),
        }
    }
}
