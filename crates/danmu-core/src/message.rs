//! Danmu message types.
//!
//! A client frame becomes an [`InboundMessage`], is validated into a
//! [`NewDanmu`] once its author is known, and becomes a [`DomainMessage`]
//! when storage assigns it an id.

use crate::collab::Principal;
use crate::room::RoomId;
use danmu_protocol::{ClientFrame, DanmuData, DanmuRecord, DisplayMode, Visibility};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A unique message identifier.
pub type MessageId = u64;

/// Prefix every credential must carry.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-local message ID.
///
/// Used when storage could not assign one.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Limits applied to submitted danmu.
#[derive(Debug, Clone)]
pub struct ContentLimits {
    /// Maximum content length in characters.
    pub max_content_chars: usize,
    /// Largest accepted font size.
    pub max_fontsize: u32,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_content_chars: 100,
            max_fontsize: 64,
        }
    }
}

/// Reasons a danmu fails validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Content is empty")]
    EmptyContent,

    #[error("Content exceeds {0} characters")]
    ContentTooLong(usize),

    #[error("Font size {0} out of range")]
    FontSize(i64),

    #[error("Unknown display mode {0}")]
    Mode(i64),

    #[error("Invalid color {0:?}")]
    Color(String),

    #[error("Time point must be a non-negative number")]
    TimePoint,
}

fn is_hex_color(color: &str) -> bool {
    match color.strip_prefix('#') {
        Some(hex) => (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// A danmu as submitted, bound to the room it was sent in.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Raw credential, `"Bearer <jwt>"`.
    pub token: Option<String>,
    /// Room the sender is attached to.
    pub room_id: RoomId,
    /// Unvalidated fields.
    pub data: DanmuData,
}

impl InboundMessage {
    /// Bind a decoded frame to a room.
    #[must_use]
    pub fn from_frame(room_id: RoomId, frame: ClientFrame) -> Self {
        Self {
            token: frame.token,
            room_id,
            data: frame.data,
        }
    }

    /// The token with its `Bearer ` prefix removed.
    ///
    /// `None` if the credential is absent, lacks the prefix, or is blank.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        let token = self.token.as_deref()?.strip_prefix(BEARER_PREFIX)?.trim();
        (!token.is_empty()).then_some(token)
    }

    /// Validate the fields and build the danmu to store.
    ///
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self, author: &Principal, limits: &ContentLimits) -> Result<NewDanmu, ValidationError> {
        let data = &self.data;

        if data.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if data.content.chars().count() > limits.max_content_chars {
            return Err(ValidationError::ContentTooLong(limits.max_content_chars));
        }

        let fontsize = u32::try_from(data.fontsize)
            .ok()
            .filter(|size| (1..=limits.max_fontsize).contains(size))
            .ok_or(ValidationError::FontSize(data.fontsize))?;

        let mode = u8::try_from(data.mode)
            .ok()
            .and_then(|mode| DisplayMode::try_from(mode).ok())
            .ok_or(ValidationError::Mode(data.mode))?;

        if !is_hex_color(&data.color) {
            return Err(ValidationError::Color(data.color.clone()));
        }

        if !data.time_point.is_finite() || data.time_point < 0.0 {
            return Err(ValidationError::TimePoint);
        }

        Ok(NewDanmu {
            room_id: self.room_id.clone(),
            author_id: author.id,
            content: data.content.clone(),
            fontsize,
            mode,
            color: data.color.clone(),
            time_point: data.time_point,
            status: Visibility::Visible,
            created_at: now_millis(),
        })
    }
}

/// A validated danmu awaiting storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDanmu {
    /// Room the danmu was sent in.
    pub room_id: RoomId,
    /// Principal that sent it.
    pub author_id: u64,
    /// Text as submitted.
    pub content: String,
    /// Font size in pixels.
    pub fontsize: u32,
    /// Where the danmu is drawn.
    pub mode: DisplayMode,
    /// `#RGB` or `#RRGGBB`.
    pub color: String,
    /// Offset into the video, in seconds.
    pub time_point: f64,
    /// Visible unless hidden by moderation.
    pub status: Visibility,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
}

impl NewDanmu {
    /// Attach the id assigned by storage.
    #[must_use]
    pub fn into_message(self, id: MessageId) -> DomainMessage {
        DomainMessage { id, danmu: self }
    }
}

/// An accepted, stored danmu. Immutable once broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainMessage {
    id: MessageId,
    danmu: NewDanmu,
}

impl DomainMessage {
    /// The stored id.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The danmu fields.
    #[must_use]
    pub fn danmu(&self) -> &NewDanmu {
        &self.danmu
    }

    /// Wire form of this message.
    #[must_use]
    pub fn to_record(&self) -> DanmuRecord {
        let d = &self.danmu;
        DanmuRecord {
            id: self.id,
            room_id: d.room_id.to_string(),
            author_id: d.author_id,
            content: d.content.clone(),
            fontsize: d.fontsize,
            mode: d.mode,
            color: d.color.clone(),
            time_point: d.time_point,
            status: d.status,
            created_at: d.created_at,
        }
    }
}
