//! Provides methods for security access (seed / key) to unlock protected services

use super::{DiagnosticSession, FromMessage, GenericResponse, Message, Service, responses::require_len};
use crate::DiagServerResult;

/// Seed returned by the ECU for an odd security level
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SecurityAccessSeedResponse {
    /// Security level the seed belongs to
    pub level: u8,
    /// Seed bytes. All zero if the level is already unlocked
    pub seed: Vec<u8>,
}

impl SecurityAccessSeedResponse {
    /// Returns true if the ECU reports the level as already unlocked
    pub fn is_unlocked(&self) -> bool {
        self.seed.iter().all(|b| *b == 0)
    }
}

impl FromMessage for SecurityAccessSeedResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 2)?;
        let b = message.bytes();
        Ok(Self {
            level: b[1],
            seed: b[2..].to_vec(),
        })
    }
}

impl DiagnosticSession {
    /// Requests the seed for `level`, which must be odd
    pub fn request_seed(&self, level: u8) -> DiagServerResult<SecurityAccessSeedResponse> {
        self.request(&Service::SecurityAccessRequestSeed(level))
    }

    /// Sends the key for `level`, which must be even (seed level + 1)
    pub fn send_key(&self, level: u8, key: &[u8]) -> DiagServerResult<GenericResponse> {
        self.request(&Service::SecurityAccessSendKey {
            level,
            key: key.to_vec(),
        })
    }
}
