//!  Provides methods to read and query DTCs on the ECU

use super::{DiagnosticSession, FromMessage, Message, Service, responses::require_len};
use crate::{
    DiagServerResult,
    dtc::{Dtc, DtcStatusMask},
};

/// List of two byte (SAE J2012) trouble codes, as returned by OBD2 services 03, 07 and 0A
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcResponse {
    /// Reported trouble codes, without the `0000` padding entries
    pub dtcs: Vec<Dtc>,
}

impl FromMessage for DtcResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 1)?;
        let b = message.bytes();
        // CAN replies carry a DTC count after the response ID, other buses do not.
        // Codes are two bytes each, so the parity of the length tells them apart
        let offset = if b.len() % 2 == 1 { 1 } else { 2 };
        let dtcs = b[offset.min(b.len())..]
            .chunks_exact(2)
            .filter(|pair| pair[0] != 0 || pair[1] != 0)
            .map(|pair| Dtc::from_obd2(pair[0], pair[1]))
            .collect();
        Ok(Self { dtcs })
    }
}

/// Reply to ReadDTCInformation / reportDTCByStatusMask
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UdsDtcResponse {
    /// Status bits the ECU supports
    pub availability_mask: DtcStatusMask,
    /// Matching trouble codes with their status
    pub dtcs: Vec<Dtc>,
}

impl FromMessage for UdsDtcResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 3)?;
        let b = message.bytes();
        let dtcs = b[3..]
            .chunks_exact(4)
            .map(|r| Dtc::from_uds([r[0], r[1], r[2]], r[3]))
            .collect();
        Ok(Self {
            availability_mask: DtcStatusMask::from_bits_retain(b[2]),
            dtcs,
        })
    }
}

impl DiagnosticSession {
    /// Returns every DTC whose status matches `mask`
    pub fn read_dtcs_by_status_mask(&self, mask: DtcStatusMask) -> DiagServerResult<UdsDtcResponse> {
        self.request(&Service::ReadDtcByStatusMask(mask))
    }
}
