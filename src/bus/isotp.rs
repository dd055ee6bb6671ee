//! Receive side ISO 15765-2 reassembly for replies printed by the adapter
//! with auto formatting off (or headers on), where every frame still carries its PCI byte

use std::cmp::min;

use super::BusProtocolDecoder;
use crate::{DiagError, DiagServerResult};

const CAN_FRAME_LENGTH: usize = 8;

/// Decoder for single and first + consecutive frame sequences.
///
/// Input is the concatenation of every frame of a reply, each 8 bytes long
/// except possibly the last one.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IsoTpDecoder;

#[derive(Debug, Default)]
struct IsoTpRxMemory {
    data: Vec<u8>,
    max_size: usize,
    next_pci: u8,
}

impl IsoTpRxMemory {
    fn add_single_frame(&mut self, s: &[u8]) -> DiagServerResult<()> {
        let len = (s[0] & 0x0F) as usize;
        if len == 0 || s.len() < 1 + len {
            return Err(DiagError::DecoderError(format!(
                "single frame announces {len} bytes, {} available",
                s.len().saturating_sub(1)
            )));
        }
        self.max_size = len;
        self.data = s[1..1 + len].to_vec();
        Ok(())
    }

    fn add_start_frame(&mut self, s: &[u8]) -> DiagServerResult<()> {
        if s.len() < 2 {
            return Err(DiagError::DecoderError("truncated first frame".into()));
        }
        self.max_size = (((s[0] & 0x0F) as usize) << 8) | s[1] as usize;
        let take = min(self.max_size, s.len() - 2);
        self.data = s[2..2 + take].to_vec();
        self.next_pci = 0x21;
        Ok(())
    }

    fn add_continuous_frame(&mut self, s: &[u8]) -> DiagServerResult<()> {
        if s[0] != self.next_pci {
            return Err(DiagError::DecoderError(format!(
                "consecutive frame {:02X} out of sequence, expected {:02X}",
                s[0], self.next_pci
            )));
        }
        let max_copy = min(self.max_size - self.data.len(), min(7, s.len() - 1));
        self.data.extend_from_slice(&s[1..1 + max_copy]);
        self.next_pci = if self.next_pci == 0x2F { 0x20 } else { self.next_pci + 1 };
        Ok(())
    }

    fn completed(&self) -> bool {
        self.data.len() == self.max_size
    }
}

impl BusProtocolDecoder for IsoTpDecoder {
    fn decode(&self, frames: &[u8]) -> DiagServerResult<Vec<u8>> {
        let first = *frames
            .first()
            .ok_or_else(|| DiagError::DecoderError("no frames".into()))?;
        let mut rx = IsoTpRxMemory::default();
        match first >> 4 {
            0x0 => rx.add_single_frame(frames)?,
            0x1 => {
                let (start, rest) = frames.split_at(min(CAN_FRAME_LENGTH, frames.len()));
                rx.add_start_frame(start)?;
                for cf in rest.chunks(CAN_FRAME_LENGTH) {
                    if rx.completed() {
                        break;
                    }
                    rx.add_continuous_frame(cf)?;
                }
            }
            // Flow control frames are handed up untouched
            0x3 => return Ok(frames.to_vec()),
            _ => {
                return Err(DiagError::DecoderError(format!(
                    "unexpected PCI byte {first:02X}"
                )));
            }
        }
        if !rx.completed() {
            return Err(DiagError::DecoderError(format!(
                "incomplete transfer, {} of {} bytes",
                rx.data.len(),
                rx.max_size
            )));
        }
        Ok(rx.data)
    }

    fn name(&self) -> &'static str {
        "ISO-TP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_strips_padding() {
        let frame = [0x03, 0x41, 0x0D, 0x32, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(IsoTpDecoder.decode(&frame).unwrap(), vec![0x41, 0x0D, 0x32]);
    }

    #[test]
    fn multi_frame_vin() {
        let mut frames = vec![0x10, 0x14, 0x49, 0x02, 0x01, 0x57, 0x50, 0x30];
        frames.extend_from_slice(&[0x21, 0x5A, 0x5A, 0x5A, 0x39, 0x39, 0x5A, 0x54]);
        frames.extend_from_slice(&[0x22, 0x53, 0x33, 0x39, 0x32, 0x31, 0x32, 0x34]);
        let decoded = IsoTpDecoder.decode(&frames).unwrap();
        assert_eq!(decoded.len(), 0x14);
        assert_eq!(&decoded[..3], &[0x49, 0x02, 0x01]);
        assert_eq!(&decoded[3..], b"WP0ZZZ99ZTS392124");
    }

    #[test]
    fn out_of_sequence_frame_is_rejected() {
        let mut frames = vec![0x10, 0x0A, 1, 2, 3, 4, 5, 6];
        frames.extend_from_slice(&[0x22, 7, 8, 9, 10]);
        assert!(matches!(
            IsoTpDecoder.decode(&frames),
            Err(DiagError::DecoderError(_))
        ));
    }

    #[test]
    fn sequence_wraps_to_0x20() {
        // 6 + 15 * 7 + 7 = 118 bytes needs CFs 21..2F then 20
        let len = 6 + 16 * 7;
        let payload: Vec<u8> = (0..len).map(|x| x as u8).collect();
        let mut frames = vec![0x10, len as u8];
        frames.extend_from_slice(&payload[..6]);
        let mut pci = 0x21u8;
        for chunk in payload[6..].chunks(7) {
            frames.push(pci);
            frames.extend_from_slice(chunk);
            pci = if pci == 0x2F { 0x20 } else { pci + 1 };
        }
        assert_eq!(IsoTpDecoder.decode(&frames).unwrap(), payload);
    }

    #[test]
    fn incomplete_transfer() {
        let frames = [0x10, 0x20, 1, 2, 3, 4, 5, 6];
        assert!(IsoTpDecoder.decode(&frames).is_err());
        assert!(IsoTpDecoder.decode(&[]).is_err());
    }
}
