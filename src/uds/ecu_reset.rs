//!  Provides methods to reset the ECU in order to simulate power cycling and resetting memory regions

use super::{DiagnosticSession, FromMessage, Message, Service, responses::require_len};
use crate::DiagServerResult;

/// ECU reset types as defined by ISO14229
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EcuResetType {
    /// Simulates a power cycle
    Hard,
    /// Simulates the ignition being switched off and on
    KeyOffOn,
    /// Restarts the application
    Soft,
    /// Enables the rapid power shutdown mode
    EnableRapidPowerShutdown,
    /// Disables the rapid power shutdown mode
    DisableRapidPowerShutdown,
}

impl From<EcuResetType> for u8 {
    fn from(t: EcuResetType) -> Self {
        match t {
            EcuResetType::Hard => 0x01,
            EcuResetType::KeyOffOn => 0x02,
            EcuResetType::Soft => 0x03,
            EcuResetType::EnableRapidPowerShutdown => 0x04,
            EcuResetType::DisableRapidPowerShutdown => 0x05,
        }
    }
}

/// Reply to an ECU reset
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EcuResetResponse {
    /// Seconds the ECU stays in the power down sequence.
    /// Only reported for [EcuResetType::EnableRapidPowerShutdown], `0xFF` otherwise
    pub power_down_time: u8,
}

impl FromMessage for EcuResetResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 2)?;
        let b = message.bytes();
        let power_down_time = if b[1] == u8::from(EcuResetType::EnableRapidPowerShutdown) {
            *b.get(2).ok_or(crate::DiagError::InvalidResponseLength)?
        } else {
            0xFF
        };
        Ok(Self { power_down_time })
    }
}

impl DiagnosticSession {
    /// Asks the ECU to perform a reset of the given type
    pub fn ecu_reset(&self, reset: EcuResetType) -> DiagServerResult<EcuResetResponse> {
        self.request(&Service::EcuReset(reset))
    }
}
