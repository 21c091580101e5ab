//! Room and connection identifiers.
//!
//! Both are opaque strings supplied by the transport layer: the room is the
//! video id, the connection id is generated by the client.

use std::fmt;

/// Maximum identifier length.
pub const MAX_ID_LENGTH: usize = 256;

/// Validate a room or connection identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Identifier cannot be empty");
    }
    if id.len() > MAX_ID_LENGTH {
        return Err("Identifier too long");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Identifier contains invalid characters");
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier without validation.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Create an identifier, rejecting empty, overlong or
            /// non-printable input.
            ///
            /// # Errors
            ///
            /// Returns the validation message on failure.
            pub fn parse(id: impl Into<String>) -> Result<Self, &'static str> {
                let id = id.into();
                validate_id(&id)?;
                Ok(Self(id))
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a room, i.e. the video being watched.
    RoomId
);

string_id!(
    /// Identifier of one attached client session.
    ConnectionId
);
