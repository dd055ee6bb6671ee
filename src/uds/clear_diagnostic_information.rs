//! Provides methods to clear diagnostic trouble codes from the ECU

use super::{DiagnosticSession, GenericResponse, Service};
use crate::DiagServerResult;

/// Group of DTC meaning "every DTC"
pub const ALL_DTC_GROUPS: u32 = 0xFF_FFFF;

impl DiagnosticSession {
    /// Clears every DTC stored on the ECU
    pub fn clear_all_dtcs(&self) -> DiagServerResult<GenericResponse> {
        self.clear_dtcs(ALL_DTC_GROUPS)
    }

    /// Clears a group of DTCs (24 bit group identifier)
    pub fn clear_dtcs(&self, group: u32) -> DiagServerResult<GenericResponse> {
        self.request(&Service::ClearDiagnosticInformation(group))
    }
}
