//! # danmu-protocol
//!
//! Wire protocol definitions for the danmu relay.
//!
//! Everything on the wire is JSON text, one frame per WebSocket message.
//!
//! ## Frames
//!
//! - [`ClientFrame`] - a client posting a danmu with its bearer token
//! - [`Envelope::Notice`] - system notices such as the viewer count
//! - [`Envelope::Message`] - an accepted danmu, broadcast to the room
//! - [`Envelope::Error`] - a rejection, sent only to the offending client
//!
//! ## Example
//!
//! ```rust
//! use danmu_protocol::{codec, Envelope};
//!
//! let text = codec::encode(&Envelope::viewers(3)).unwrap();
//! assert_eq!(text, r#"{"type":"notice","text":"current viewers: 3","viewers":3}"#);
//! assert_eq!(codec::decode(&text).unwrap(), Envelope::viewers(3));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_client, decode_client_bytes, encode, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{codes, ClientFrame, DanmuData, DanmuRecord, DisplayMode, Envelope, Visibility};
