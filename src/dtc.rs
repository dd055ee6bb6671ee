//! Module for common Diagnostic trouble code data

use std::fmt::{Display, Formatter, Result as FmtResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// DTC name interpretation format specifier
pub enum DtcFormatType {
    /// ISO15031-6 DTC Format (2 bytes, as returned by OBD2)
    Iso15031_6,
    /// ISO14229-1 DTC Format (2 bytes of ISO15031-6 plus a failure type byte)
    Iso14229_1,
}

bitflags::bitflags! {
    /// ISO14229 DTC status byte. Also used as the mask for
    /// [crate::uds::Service::ReadDtcByStatusMask]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DtcStatusMask: u8 {
        /// Most recent test failed
        const TEST_FAILED = 0x01;
        /// Test failed during the current operation cycle
        const TEST_FAILED_THIS_OPERATION_CYCLE = 0x02;
        /// Pending DTC
        const PENDING_DTC = 0x04;
        /// Confirmed DTC
        const CONFIRMED_DTC = 0x08;
        /// Test not completed since the last clear
        const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR = 0x10;
        /// Test failed since the last clear
        const TEST_FAILED_SINCE_LAST_CLEAR = 0x20;
        /// Test not completed during the current operation cycle
        const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE = 0x40;
        /// Warning indicator (MIL) requested
        const WARNING_INDICATOR_REQUESTED = 0x80;
    }
}

/// Where an OBD2 ECU keeps a DTC. Each area is read with its own service
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DtcStorageArea {
    /// Confirmed DTCs (service 03)
    Stored,
    /// DTCs detected during the current or last driving cycle (service 07)
    Pending,
    /// DTCs which cannot be cleared by a scan tool (service 0A)
    Permanent,
}

/// Diagnostic trouble code (DTC) storage struct
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dtc {
    /// The [DtcFormatType] of the DTC. This is used
    /// to interpret the raw value of the DTC
    pub format: DtcFormatType,
    /// The raw value of the DTC according to the ECU
    pub raw: u32,
    /// Status byte, if the ECU reported one
    pub status: Option<DtcStatusMask>,
}

impl Dtc {
    /// Creates a DTC out of the two byte OBD2 representation
    pub fn from_obd2(hi: u8, lo: u8) -> Self {
        Self {
            format: DtcFormatType::Iso15031_6,
            raw: u16::from_be_bytes([hi, lo]) as u32,
            status: None,
        }
    }

    /// Creates a DTC out of a UDS DTC record (3 byte code plus status)
    pub fn from_uds(code: [u8; 3], status: u8) -> Self {
        Self {
            format: DtcFormatType::Iso14229_1,
            raw: u32::from_be_bytes([0, code[0], code[1], code[2]]),
            status: Some(DtcStatusMask::from_bits_retain(status)),
        }
    }

    /// Returns the human readable name of the DTC, such as `P0301` or `U0100-87`
    pub fn name(&self) -> String {
        let base = match self.format {
            DtcFormatType::Iso15031_6 => self.raw as u16,
            DtcFormatType::Iso14229_1 => (self.raw >> 8) as u16,
        };
        let system = match base >> 14 {
            0 => 'P',
            1 => 'C',
            2 => 'B',
            _ => 'U',
        };
        let name = format!("{system}{:01X}{:03X}", (base >> 12) & 0x03, base & 0x0FFF);
        match self.format {
            DtcFormatType::Iso15031_6 => name,
            DtcFormatType::Iso14229_1 => format!("{name}-{:02X}", self.raw & 0xFF),
        }
    }
}

impl Display for Dtc {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obd2_names() {
        assert_eq!(Dtc::from_obd2(0x03, 0x01).name(), "P0301");
        assert_eq!(Dtc::from_obd2(0x41, 0x23).name(), "C0123");
        assert_eq!(Dtc::from_obd2(0x9A, 0xBC).name(), "B1ABC");
        assert_eq!(Dtc::from_obd2(0xC1, 0x00).name(), "U0100");
    }

    #[test]
    fn uds_name_and_status() {
        let dtc = Dtc::from_uds([0xC1, 0x00, 0x87], 0x09);
        assert_eq!(dtc.to_string(), "U0100-87");
        let status = dtc.status.unwrap();
        assert!(status.contains(DtcStatusMask::TEST_FAILED | DtcStatusMask::CONFIRMED_DTC));
        assert!(!status.contains(DtcStatusMask::PENDING_DTC));
    }
}
