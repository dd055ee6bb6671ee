//! Addressed diagnostic payload

use std::fmt::{Display, Formatter, Result as FmtResult};

use automotive_diag::{ByteWrapper::Standard, uds::UdsError};

use super::{NEGATIVE_RESPONSE_INDICATOR, POSITIVE_RESPONSE_OFFSET};
use crate::{DiagError, DiagServerResult, Header};

/// Bit that turns a physical request header into the matching reply header (`0x7E0` -> `0x7E8`)
pub const REPLY_OFFSET: Header = 1 << 3;

/// Maximum number of payload bytes shown by [Message]'s `Display`
const DISPLAY_LIMIT: usize = 16;

/// A payload together with the header it is sent on and the header its reply is expected on.
///
/// The payload is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    id: Header,
    reply: Header,
    bytes: Vec<u8>,
}

impl Message {
    /// Creates a message on header `id`, expecting its reply on `id | 0x08`
    pub fn new(id: Header, bytes: Vec<u8>) -> DiagServerResult<Self> {
        Self::with_reply(id, id | REPLY_OFFSET, bytes)
    }

    /// Creates a message with an explicit reply header
    pub fn with_reply(id: Header, reply: Header, bytes: Vec<u8>) -> DiagServerResult<Self> {
        if bytes.is_empty() {
            return Err(DiagError::MalformedService);
        }
        Ok(Self { id, reply, bytes })
    }

    /// Returns a copy of this message with a different payload, keeping the addressing
    pub fn with_bytes(&self, bytes: Vec<u8>) -> DiagServerResult<Self> {
        Self::with_reply(self.id, self.reply, bytes)
    }

    /// Header the message is sent on
    pub fn id(&self) -> Header {
        self.id
    }

    /// Header the reply is expected on
    pub fn reply(&self) -> Header {
        self.reply
    }

    /// Payload
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the message, returning its payload
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Returns true if this is a negative response (`7F <sid> <nrc>`)
    pub fn is_negative_response(&self) -> bool {
        self.bytes[0] == NEGATIVE_RESPONSE_INDICATOR
    }

    /// Returns true if this is a positive response to some service
    pub fn is_response(&self) -> bool {
        !self.is_negative_response() && self.bytes[0] & POSITIVE_RESPONSE_OFFSET != 0
    }

    /// Returns true if this is a "request correctly received, response pending" reply
    pub fn is_response_pending(&self) -> bool {
        self.is_negative_response()
            && self
                .bytes
                .get(2)
                .is_some_and(|nrc| is_response_pending_code(*nrc))
    }

    /// Returns the negative response code, if this is a negative response
    pub fn negative_response_code(&self) -> Option<u8> {
        if self.is_negative_response() {
            self.bytes.get(2).copied()
        } else {
            None
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.id > 0xFFF {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.bytes.len())?;
        for b in self.bytes.iter().take(DISPLAY_LIMIT) {
            write!(f, " {b:02X}")?;
        }
        if self.bytes.len() > DISPLAY_LIMIT {
            write!(f, " (...)")?;
        }
        Ok(())
    }
}

/// Returns true if `nrc` asks the tester to keep waiting
pub fn is_response_pending_code(nrc: u8) -> bool {
    matches!(
        automotive_diag::uds::UdsErrorByte::from(nrc),
        Standard(UdsError::RequestCorrectlyReceivedResponsePending)
    )
}
