//! Keeps a non default diagnostic session alive

use super::{DiagnosticSession, GenericResponse, Service};
use crate::DiagServerResult;

/// Tester present sub functions
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TesterPresentType {
    /// The ECU answers
    SendResponse,
    /// The ECU stays silent (suppress positive response bit)
    SuppressResponse,
}

impl From<TesterPresentType> for u8 {
    fn from(t: TesterPresentType) -> Self {
        match t {
            TesterPresentType::SendResponse => 0x00,
            TesterPresentType::SuppressResponse => 0x80,
        }
    }
}

impl DiagnosticSession {
    /// Tells the ECU a tester is still connected, waiting for its acknowledgement
    pub fn tester_present(&self) -> DiagServerResult<GenericResponse> {
        self.request(&Service::TesterPresent(TesterPresentType::SendResponse))
    }
}
