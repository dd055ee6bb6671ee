//! Provides methods to start, stop and query routines on the ECU

use super::{DiagnosticSession, GenericResponse, Service};
use crate::DiagServerResult;

/// Routine control sub functions
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RoutineControlType {
    /// Start the routine
    Start,
    /// Stop the routine
    Stop,
    /// Request its results
    RequestResults,
}

impl From<RoutineControlType> for u8 {
    fn from(t: RoutineControlType) -> Self {
        match t {
            RoutineControlType::Start => 0x01,
            RoutineControlType::Stop => 0x02,
            RoutineControlType::RequestResults => 0x03,
        }
    }
}

/// Routine identifier for erasing memory before a download
pub const ROUTINE_ERASE_MEMORY: u16 = 0xFF00;

impl DiagnosticSession {
    /// Triggers routine `id` with an optional option record
    pub fn routine_control(
        &self,
        control: RoutineControlType,
        id: u16,
        option_record: &[u8],
    ) -> DiagServerResult<GenericResponse> {
        self.request(&Service::RoutineControl {
            control_type: control,
            id,
            parameters: option_record.to_vec(),
        })
    }
}
