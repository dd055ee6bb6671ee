//! Provides methods to enable and disable normal message transmission of the ECU

use super::{DiagnosticSession, GenericResponse, Service};
use crate::DiagServerResult;

/// Communication control sub functions
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommunicationControlType {
    /// Enable reception and transmission
    EnableRxAndTx,
    /// Enable reception, disable transmission
    EnableRxDisableTx,
    /// Disable reception, enable transmission
    DisableRxEnableTx,
    /// Disable reception and transmission
    DisableRxAndTx,
}

impl From<CommunicationControlType> for u8 {
    fn from(t: CommunicationControlType) -> Self {
        match t {
            CommunicationControlType::EnableRxAndTx => 0x00,
            CommunicationControlType::EnableRxDisableTx => 0x01,
            CommunicationControlType::DisableRxEnableTx => 0x02,
            CommunicationControlType::DisableRxAndTx => 0x03,
        }
    }
}

/// Normal communication messages
pub const NORMAL_COMMUNICATION: u8 = 0x01;
/// Network management communication messages
pub const NETWORK_MANAGEMENT_COMMUNICATION: u8 = 0x02;

impl DiagnosticSession {
    /// Changes which messages the ECU sends and receives
    pub fn communication_control(
        &self,
        control: CommunicationControlType,
        communication_type: u8,
    ) -> DiagServerResult<GenericResponse> {
        self.request(&Service::CommunicationControl {
            control_type: control.into(),
            communication_type,
        })
    }
}
