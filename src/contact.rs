//! Contact records.
//!
//! A contact is the application-layer view of a peer: its network address,
//! a local nickname, and runtime presence. Contacts are plaintext data
//! owned by the consumer; the core only reads the address.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::identity::normalize_address;

/// A known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's network address (unique key).
    pub address: String,

    /// Local display nickname.
    pub nickname: String,

    /// Runtime presence flag, never persisted.
    #[serde(skip)]
    pub online: bool,

    /// Unix timestamp of the last observed activity.
    pub last_seen: Option<i64>,
}

impl Contact {
    /// Create a contact after validating and normalizing its address.
    pub fn new(address: &str, nickname: &str) -> Result<Self, CoreError> {
        Ok(Self {
            address: normalize_address(address)?,
            nickname: nickname.to_string(),
            online: false,
            last_seen: None,
        })
    }

    /// Record activity from this contact.
    pub fn mark_seen(&mut self) {
        self.online = true;
        self.last_seen = Some(chrono::Utc::now().timestamp());
    }

    /// Record that this contact went offline.
    pub fn mark_offline(&mut self) {
        self.online = false;
    }
}
