//! Bus protocols an ELM327 class adapter can speak, and the framing codecs
//! installed once a protocol has been negotiated

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crate::{DiagServerResult, Header};

mod codec;
mod isotp;
mod kwp;

pub use codec::*;
pub use isotp::*;
pub use kwp::*;

/// Functional broadcast header for 11 bit CAN
pub const BROADCAST_11_BIT: Header = 0x7DF;
/// Functional broadcast header for 29 bit CAN
pub const BROADCAST_29_BIT: Header = 0x18DB33F1;
/// Functional broadcast header for KWP / ISO9141 / J1850
pub const BROADCAST_KWP: Header = 0x81F110;

/// Bus protocol, identified by the numeric code used with `ATSP` / `ATDPN`
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
    strum_macros::EnumIter,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusProtocol {
    /// Not yet known
    #[strum(serialize = "?")]
    Unknown,
    /// Let the adapter search for a protocol
    #[strum(serialize = "0")]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    #[strum(serialize = "1")]
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    #[strum(serialize = "2")]
    J1850Vpwm,
    /// ISO 9141-2 (5 baud init)
    #[strum(serialize = "3")]
    Iso9141_2,
    /// ISO 14230-4 KWP (5 baud init)
    #[strum(serialize = "4")]
    Kwp2000_5Kbps,
    /// ISO 14230-4 KWP (fast init)
    #[strum(serialize = "5")]
    Kwp2000Fast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    #[strum(serialize = "6")]
    Can11B500K,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    #[strum(serialize = "7")]
    Can29B500K,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    #[strum(serialize = "8")]
    Can11B250K,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    #[strum(serialize = "9")]
    Can29B250K,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    #[strum(serialize = "A")]
    CanSaeJ1939,
    /// User1 CAN (11 bit ID, 125 kbaud)
    #[strum(serialize = "B")]
    User1Can11B125K,
    /// User2 CAN (11 bit ID, 50 kbaud)
    #[strum(serialize = "C")]
    User2Can11B50K,
}

impl BusProtocol {
    /// Numeric code of the protocol as sent with `ATSP`
    pub fn code(&self) -> &'static str {
        self.into()
    }

    /// Returns true for the ISO 15765 / J1939 / user CAN protocols
    pub fn is_can(&self) -> bool {
        u8::from_str_radix(self.code(), 16).is_ok_and(|c| (0x6..=0xD).contains(&c))
    }

    /// Returns true for the two ISO 14230 variants
    pub fn is_kwp(&self) -> bool {
        matches!(self, Self::Kwp2000_5Kbps | Self::Kwp2000Fast)
    }

    /// Returns true if this protocol uses 29 bit CAN identifiers
    pub fn is_extended_can(&self) -> bool {
        matches!(self, Self::Can29B500K | Self::Can29B250K | Self::CanSaeJ1939)
    }

    /// Number of hex characters the adapter prints for a frame header when headers are on
    pub fn header_characters(&self) -> usize {
        if self.is_extended_can() {
            8
        } else if self.is_can() {
            3
        } else {
            6
        }
    }

    /// Functional broadcast header used to address all ECUs on this bus
    pub fn broadcast_header(&self) -> Option<Header> {
        match self {
            Self::Can11B500K | Self::Can11B250K | Self::User1Can11B125K | Self::User2Can11B50K => {
                Some(BROADCAST_11_BIT)
            }
            Self::Can29B500K | Self::Can29B250K => Some(BROADCAST_29_BIT),
            Self::J1850Pwm
            | Self::J1850Vpwm
            | Self::Iso9141_2
            | Self::Kwp2000_5Kbps
            | Self::Kwp2000Fast => Some(BROADCAST_KWP),
            Self::Unknown | Self::Auto | Self::CanSaeJ1939 => None,
        }
    }
}

impl Display for BusProtocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Auto => "Automatic",
            Self::J1850Pwm => "SAE J1850 PWM",
            Self::J1850Vpwm => "SAE J1850 VPW",
            Self::Iso9141_2 => "ISO 9141-2",
            Self::Kwp2000_5Kbps => "ISO 14230-4 KWP (5 baud init)",
            Self::Kwp2000Fast => "ISO 14230-4 KWP (fast init)",
            Self::Can11B500K => "ISO 15765-4 CAN (11 bit ID, 500 kbaud)",
            Self::Can29B500K => "ISO 15765-4 CAN (29 bit ID, 500 kbaud)",
            Self::Can11B250K => "ISO 15765-4 CAN (11 bit ID, 250 kbaud)",
            Self::Can29B250K => "ISO 15765-4 CAN (29 bit ID, 250 kbaud)",
            Self::CanSaeJ1939 => "SAE J1939 CAN (29 bit ID, 250 kbaud)",
            Self::User1Can11B125K => "User1 CAN (11 bit ID, 125 kbaud)",
            Self::User2Can11B50K => "User2 CAN (11 bit ID, 50 kbaud)",
        };
        f.write_str(name)
    }
}

/// Adds link layer framing to an outgoing payload
pub trait BusProtocolEncoder: Debug + Send {
    /// Frames `payload` for transmission
    fn encode(&self, payload: &[u8]) -> DiagServerResult<Vec<u8>>;
    /// Largest frame (including any framing bytes) the encoder produces
    fn maximum_frame_length(&self) -> usize;
    /// Largest payload one call to [BusProtocolEncoder::encode] accepts
    fn maximum_payload_length(&self) -> usize {
        self.maximum_frame_length()
    }
    /// Position of the service ID inside an encoded frame
    fn payload_offset(&self) -> usize {
        0
    }
}

/// Removes link layer framing from the concatenated frames of a reply
pub trait BusProtocolDecoder: Debug + Send {
    /// Reassembles a payload out of `frames`
    fn decode(&self, frames: &[u8]) -> DiagServerResult<Vec<u8>>;
    /// Short name of the framing, for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn codes_round_trip() {
        for p in BusProtocol::iter() {
            assert_eq!(BusProtocol::from_str(p.code()).unwrap(), p);
        }
        assert!(BusProtocol::from_str("D").is_err());
    }

    #[test]
    fn can_and_kwp_predicates() {
        let can: Vec<BusProtocol> = BusProtocol::iter().filter(|p| p.is_can()).collect();
        assert_eq!(can.len(), 7);
        assert!(can.iter().all(|p| !p.is_kwp()));
        assert!(BusProtocol::Kwp2000Fast.is_kwp());
        assert!(!BusProtocol::Auto.is_can());
        assert!(!BusProtocol::Unknown.is_can());
    }

    #[test]
    fn headers() {
        assert_eq!(BusProtocol::Can11B500K.broadcast_header(), Some(0x7DF));
        assert_eq!(BusProtocol::Can29B250K.broadcast_header(), Some(0x18DB33F1));
        assert_eq!(BusProtocol::Kwp2000Fast.broadcast_header(), Some(0x81F110));
        assert_eq!(BusProtocol::Can11B500K.header_characters(), 3);
        assert_eq!(BusProtocol::Can29B500K.header_characters(), 8);
        assert_eq!(BusProtocol::Kwp2000Fast.header_characters(), 6);
    }
}
