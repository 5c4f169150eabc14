//! ID generation utilities.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::{AppError, AppResult};

const ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const GENERATED_ROOM_ID_LEN: usize = 6;
const MAX_ROOM_ID_LEN: usize = 64;

/// Opaque key of one voting room.
///
/// Scopes every vote record, broadcast channel and vote lock for the
/// lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Parse a room id supplied from outside (config, URL, HTTP).
    pub fn parse(raw: impl Into<String>) -> AppResult<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_ROOM_ID_LEN {
            return Err(AppError::Validation(format!(
                "room id must be 1..={MAX_ROOM_ID_LEN} characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::Validation(format!(
                "room id contains invalid characters: {raw}"
            )));
        }
        Ok(Self(raw))
    }

    /// Generate a random 6-character base-36 room id.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..GENERATED_ROOM_ID_LEN)
            .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which this room's local vote lock is persisted.
    #[must_use]
    pub fn lock_key(&self) -> String {
        format!("voted_{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

/// ID generator for records and sessions.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID.
    ///
    /// Used as the primary key of vote records; it carries a timestamp and
    /// randomness only, never anything about the voter.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate an id for one device session.
    #[must_use]
    pub fn generate_session_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}
