//! Module for UDS (Unified diagnostic services - ISO14229)
//!
//! Requests are described by [Service], sent through a [Pipeline] and answered with a
//! type implementing [FromMessage], as chosen by the caller of [DiagnosticSession::request].
//! The per-service files extend [DiagnosticSession] with convenience calls.

mod clear_diagnostic_information;
mod communication_control;
mod diagnostic_session_control;
mod ecu_reset;
mod message;
mod pipeline;
mod read_data_by_identifier;
mod read_dtc_information;
mod responses;
mod routine_control;
mod security_access;
mod services;
mod session;
mod tester_present;
mod transfer;

pub use clear_diagnostic_information::*;
pub use communication_control::*;
pub use diagnostic_session_control::*;
pub use ecu_reset::*;
pub use message::*;
pub use pipeline::*;
pub use read_data_by_identifier::*;
pub use read_dtc_information::*;
pub use responses::*;
pub use routine_control::*;
pub use security_access::*;
pub use services::*;
pub use session::*;
pub use tester_present::*;
pub use transfer::*;

/// First byte of every negative response
pub const NEGATIVE_RESPONSE_INDICATOR: u8 = 0x7F;

/// Added to a service ID to form its positive response ID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Largest data block a single TransferData request may carry.
/// The ISO-TP ceiling (4095) minus the service ID and the sequence counter
pub const MAX_TRANSFER_DATA_LENGTH: usize = 4093;
