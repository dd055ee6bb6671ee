//! KWP framing placeholder

use super::BusProtocolDecoder;
use crate::{DiagError, DiagServerResult};

/// Decoder installed for the ISO 14230 protocols.
///
/// Reassembly of KWP replies (header stripping and checksum removal across
/// multiple frames) is not implemented, every call fails with [DiagError::DecoderError]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KwpDecoder;

impl BusProtocolDecoder for KwpDecoder {
    fn decode(&self, _frames: &[u8]) -> DiagServerResult<Vec<u8>> {
        Err(DiagError::DecoderError(
            "KWP frame reassembly is not implemented".into(),
        ))
    }

    fn name(&self) -> &'static str {
        "KWP"
    }
}
