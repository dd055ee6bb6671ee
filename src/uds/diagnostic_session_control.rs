//!  Provides methods to manipulate the ECUs diagnostic session mode

use std::time::Duration;

use super::{DiagnosticSession, FromMessage, Message, Service, responses::require_len};
use crate::DiagServerResult;

/// Diagnostic session types as defined by ISO14229
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagnosticSessionType {
    /// Default session, active after power up
    Default,
    /// Programming session, used for flashing
    Programming,
    /// Extended diagnostic session
    Extended,
    /// Safety system diagnostic session
    SafetySystem,
    /// Vendor specific session
    Other(u8),
}

impl From<DiagnosticSessionType> for u8 {
    fn from(t: DiagnosticSessionType) -> Self {
        match t {
            DiagnosticSessionType::Default => 0x01,
            DiagnosticSessionType::Programming => 0x02,
            DiagnosticSessionType::Extended => 0x03,
            DiagnosticSessionType::SafetySystem => 0x04,
            DiagnosticSessionType::Other(x) => x,
        }
    }
}

/// Timing parameters returned when a session is started
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DiagnosticSessionResponse {
    /// Session that was started
    pub session: u8,
    /// Maximum time until the first response to a request (P2server_max)
    pub p2_server_max: Duration,
    /// Maximum time until the next response after a "response pending" (P2*server_max)
    pub p2_extended_server_max: Duration,
}

impl FromMessage for DiagnosticSessionResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 6)?;
        let b = message.bytes();
        let p2 = u16::from_be_bytes([b[2], b[3]]);
        let p2_ext = u16::from_be_bytes([b[4], b[5]]);
        Ok(Self {
            session: b[1],
            p2_server_max: Duration::from_millis(p2 as u64),
            p2_extended_server_max: Duration::from_millis(p2_ext as u64 * 10),
        })
    }
}

impl DiagnosticSession {
    /// Requests the ECU to go into a specific diagnostic session mode
    pub fn start(&self, session: DiagnosticSessionType) -> DiagServerResult<DiagnosticSessionResponse> {
        self.request(&Service::DiagnosticSessionControl(session))
    }
}
