#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which talks to vehicle ECUs through cheap ELM327-class serial adapters
//! ("OBD2 to RS232 interpreters") and the STN11xx / STN22xx / UniCarScan chips that extend them.
//!
//! ## How it fits together
//!
//! The adapter exposes no structured API. Everything is done with ASCII directives terminated by
//! a carriage return, and every reply ends with a `>` prompt. This crate layers a diagnostic stack on
//! top of that text protocol:
//!
//! * [hardware::elm327::CommandQueue] serializes string commands over a [channel::ByteChannel],
//!   applying per-command timeouts and detecting reply boundaries.
//! * [hardware::elm327::SerialAdapter] brings the adapter up: it probes for presence, identifies the
//!   chipset, configures it and negotiates the bus protocol.
//! * [bus] holds the bus protocol table and the framing codecs selected during negotiation.
//! * [uds] builds service PDUs, filters transient replies and decodes typed responses.
//! * [uds::DiagnosticSession] and [obd2::Obd2Session] issue requests to a single ECU (or the OBD2
//!   broadcast address), including the chunked block transfer used for flashing.
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - UDS is an advanced diagnostic protocol utilized by almost all vehicle manufacturers from 2006 onwards.
//! It allows reading and writing directly to the ECU, and should therefore be used with caution.
//!
//! ### On-board diagnostics (OBD2)
//! SAE J1979 - OBD2 is a legal requirement on all vehicles produced from 2002, allowing for
//! reading of sensor data, reading and clearing standard DTCs, and reading basic vehicle information.
//!
//! ## Concurrency
//!
//! Protocol logic is single threaded. The serial adapter is a state machine which is advanced by
//! calling [hardware::elm327::SerialAdapter::poll]; the blocking methods of [hardware::Adapter] simply
//! pump that loop until their request resolves. Sessions share an adapter through an
//! `Arc<Mutex<_>>`, so only one request is ever in flight.

use hardware::AdapterState;

pub mod bus;
pub mod channel;
pub mod dtc;
pub mod hardware;
pub mod obd2;
pub mod transcript;
pub mod uds;

pub use automotive_diag::ByteWrapper::*;
use automotive_diag::uds::UdsErrorByte;
pub use bus::BusProtocol;
pub use channel::ChannelError;

/// Bus arbitration identifier (11 bit or 29 bit CAN ID, or a KWP address)
pub type Header = u32;

/// Diagnostic server result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic server error
pub enum DiagError {
    /// The service could not be turned into a valid request payload
    #[error("Service request payload is malformed")]
    MalformedService,
    /// The bus protocol encoder could not frame the payload
    #[error("Bus protocol encoder error: {0}")]
    EncoderError(String),
    /// The bus protocol decoder could not reassemble the reply
    #[error("Bus protocol decoder error: {0}")]
    DecoderError(String),
    /// The adapter rejected a directive ('?' reply)
    #[error("Adapter did not recognize the command")]
    UnrecognizedCommand,
    /// Nothing came back before the command timed out
    #[error("No response")]
    NoResponse,
    /// Diagnostic error code from the ECU itself
    #[error("ECU Negative response: {0:?}")]
    UdsNegativeResponse(UdsErrorByte),
    /// The adapter replied with one of its textual error conditions
    #[error("Adapter reported an error: '{0}'")]
    AdapterError(String),
    /// ECU Responded with a message, but the length was incorrect
    #[error("ECU response size was not the correct length")]
    InvalidResponseLength,
    /// ECU Responded but send a message that wasn't a reply for the sent message
    #[error("ECU response is out of order")]
    WrongMessage,
    /// A parameter given to the function is invalid. Check the function's documentation
    /// for more information
    #[error("Diagnostic function parameter invalid")]
    ParameterInvalid,
    /// The adapter has not finished negotiating a bus protocol
    #[error("Adapter is not connected")]
    AdapterNotConnected,
    /// The adapter reached a terminal state before the request resolved
    #[error("Adapter is gone")]
    AdapterGone,
    /// Operation is not allowed in the adapter's current state
    #[error("Operation not allowed while adapter is {0}")]
    IllegalState(AdapterState),
    /// No codec exists for the bus protocol the adapter locked onto
    #[error("Bus protocol {0:?} is not supported")]
    UnsupportedBusProtocol(BusProtocol),
    /// Error with underlying communication channel
    #[error("Diagnostic server hardware channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
}

/// Formats bytes as contiguous upper case hex, as used on the adapter's wire
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02X}"));
    }
    s
}

/// Parses contiguous hex (whitespace is ignored). Returns `None` on an odd digit
/// count or any non hex character
pub(crate) fn parse_hex(input: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = input.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_helpers() {
        assert_eq!(hex_string(&[0x7E, 0x08, 0xF1]), "7E08F1");
        assert_eq!(parse_hex("7e 08F1"), Some(vec![0x7E, 0x08, 0xF1]));
        assert_eq!(parse_hex("7E0"), None);
        assert_eq!(parse_hex("ZZ"), None);
    }
}
