//! Typed decoding of positive responses

use std::fmt::{Display, Formatter, Result as FmtResult};

use super::Message;
use crate::{DiagError, DiagServerResult};

/// A type that can be decoded from a positive response.
///
/// The caller of [super::DiagnosticSession::request] chooses which type a reply is decoded into,
/// so any type implementing this trait can be used with any service.
pub trait FromMessage: Sized {
    /// Decodes `message`, whose first byte is the positive response ID
    fn from_message(message: &Message) -> DiagServerResult<Self>;
}

/// Ensures a message carries at least `len` bytes
pub(crate) fn require_len(message: &Message, len: usize) -> DiagServerResult<()> {
    if message.bytes().len() < len {
        Err(DiagError::InvalidResponseLength)
    } else {
        Ok(())
    }
}

/// Maps a byte to a printable character, substituting `.` for anything outside `0x09..0x80`
pub(crate) fn ascii_char(b: u8) -> char {
    if b > 0x08 && b < 0x80 {
        b as char
    } else {
        '.'
    }
}

/// Response with a vendor specific parameter record, kept as is
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GenericResponse {
    /// Every byte of the response, including the response ID
    pub record: Vec<u8>,
}

impl FromMessage for GenericResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        Ok(Self {
            record: message.bytes().to_vec(),
        })
    }
}

impl Display for GenericResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "GenericResponse: {}", crate::hex_string(&self.record))
    }
}

/// Response interpreted as ASCII text
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StringResponse {
    /// The whole response as text
    pub string: String,
}

impl FromMessage for StringResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        Ok(Self {
            string: message
                .bytes()
                .iter()
                .map(|b| if b.is_ascii() { *b as char } else { '.' })
                .collect(),
        })
    }
}

impl Display for StringResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "StringResponse: '{}'", self.string)
    }
}

/// The raw message itself
impl FromMessage for Message {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        Ok(message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_and_string() {
        let m = Message::new(0x7E8, vec![0x41, 0x42, 0xFF]).unwrap();
        let g = GenericResponse::from_message(&m).unwrap();
        assert_eq!(g.record, vec![0x41, 0x42, 0xFF]);
        let s = StringResponse::from_message(&m).unwrap();
        assert_eq!(s.string, "AB.");
        assert_eq!(s.to_string(), "StringResponse: 'AB.'");
    }

    #[test]
    fn length_check() {
        let m = Message::new(0x7E8, vec![0x62]).unwrap();
        assert!(require_len(&m, 1).is_ok());
        assert!(matches!(
            require_len(&m, 3),
            Err(DiagError::InvalidResponseLength)
        ));
    }
}
