//! Null framing: the adapter (or the STN chip's own segmentation) does the real work

use super::BusProtocolEncoder;
use crate::{DiagError, DiagServerResult};

/// Encoder which passes payloads through untouched, optionally prefixed with an
/// ISO 15765 single frame length byte, and refuses anything that does not fit one frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NullProtocolEncoder {
    maximum_frame_length: usize,
    length_prefix: bool,
}

impl NullProtocolEncoder {
    /// Creates a pass through encoder for frames of up to `maximum_frame_length` bytes.
    /// Used when the adapter formats frames itself (`ATCAF1`, KWP, STN auto segmentation)
    pub fn new(maximum_frame_length: usize) -> Self {
        Self {
            maximum_frame_length,
            length_prefix: false,
        }
    }

    /// Creates an encoder which writes the single frame PCI byte itself.
    /// Used when CAN auto formatting is off
    pub fn length_prefixed(maximum_frame_length: usize) -> Self {
        Self {
            maximum_frame_length,
            length_prefix: true,
        }
    }
}

impl BusProtocolEncoder for NullProtocolEncoder {
    fn encode(&self, payload: &[u8]) -> DiagServerResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(DiagError::EncoderError("empty payload".into()));
        }
        if payload.len() > self.maximum_payload_length() {
            return Err(DiagError::EncoderError(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.maximum_payload_length()
            )));
        }
        if self.length_prefix {
            let mut frame = Vec::with_capacity(payload.len() + 1);
            frame.push(payload.len() as u8);
            frame.extend_from_slice(payload);
            Ok(frame)
        } else {
            Ok(payload.to_vec())
        }
    }

    fn maximum_frame_length(&self) -> usize {
        self.maximum_frame_length
    }

    fn maximum_payload_length(&self) -> usize {
        if self.length_prefix {
            self.maximum_frame_length.saturating_sub(1)
        } else {
            self.maximum_frame_length
        }
    }

    fn payload_offset(&self) -> usize {
        usize::from(self.length_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through() {
        let enc = NullProtocolEncoder::new(7);
        assert_eq!(enc.encode(&[0x22, 0xF1, 0x90]).unwrap(), vec![0x22, 0xF1, 0x90]);
        assert!(matches!(enc.encode(&[0; 8]), Err(DiagError::EncoderError(_))));
        assert!(matches!(enc.encode(&[]), Err(DiagError::EncoderError(_))));
        assert_eq!(enc.payload_offset(), 0);
    }

    #[test]
    fn length_prefix() {
        let enc = NullProtocolEncoder::length_prefixed(8);
        assert_eq!(enc.encode(&[0x3E, 0x00]).unwrap(), vec![0x02, 0x3E, 0x00]);
        assert_eq!(enc.maximum_payload_length(), 7);
        assert!(enc.encode(&[0; 8]).is_err());
        assert_eq!(enc.payload_offset(), 1);
    }
}
