//! The hardware module contains the ELM327 / STN serial adapter driver, the
//! [Adapter] abstraction diagnostic sessions are written against, and transports
//! for real serial ports and for simulation

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::mpsc,
};

use crate::{BusProtocol, DiagServerResult, Header, channel::ByteChannel, uds::Message};

pub mod elm327;
#[cfg(feature = "serial")]
pub mod serial;
pub mod simulation;

pub use elm327::StringCommand;

/// Lifecycle of an adapter.
///
/// `Created -> Searching -> {NotFound | Initializing} -> Configuring -> {Connected | UnsupportedProtocol} -> Gone`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// Nothing has been sent yet
    Created,
    /// Probing for the presence of an adapter
    Searching,
    /// Nothing answered the presence probe (terminal)
    NotFound,
    /// An adapter answered, running the initialisation sequence
    Initializing,
    /// Identified, negotiating the bus protocol
    Configuring,
    /// Ready for diagnostic traffic
    Connected,
    /// The adapter could not lock onto a usable bus protocol (terminal)
    UnsupportedProtocol,
    /// The transport closed or the adapter was shut down (terminal)
    Gone,
}

impl AdapterState {
    /// Returns true for states that can never be left
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotFound | Self::UnsupportedProtocol | Self::Gone)
    }
}

impl Display for AdapterState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            Self::Created => "created",
            Self::Searching => "searching",
            Self::NotFound => "not found",
            Self::Initializing => "initializing",
            Self::Configuring => "configuring",
            Self::Connected => "connected",
            Self::UnsupportedProtocol => "unsupported protocol",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// Interpreter chip inside the adapter
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterIc {
    /// Not identified
    #[default]
    Unknown,
    /// ELM327 or one of its many clones
    Elm327,
    /// ScanTool.net STN11xx
    Stn11xx,
    /// ScanTool.net STN21xx / STN22xx
    Stn22xx,
    /// WGSoft.de UniCarScan
    UniCarScan,
}

impl AdapterIc {
    /// Largest frame the chip can segment on its own. 0 if it cannot
    pub fn maximum_auto_segmentation_frame_length(&self) -> usize {
        match self {
            Self::Stn11xx => 0x7FF,
            Self::Stn22xx => 0xFFF,
            Self::UniCarScan => 0xFF,
            Self::Unknown | Self::Elm327 => 0,
        }
    }

    /// Returns true for the ScanTool.net chips that support `ST` commands
    pub fn is_stn(&self) -> bool {
        matches!(self, Self::Stn11xx | Self::Stn22xx)
    }
}

/// Identity of an adapter, committed once the initialisation sequence completes
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdapterInfo {
    /// Identification string (`ELM327`, `STN1110`, ...)
    pub identification: String,
    /// Model name
    pub model: String,
    /// Chip type
    pub ic: AdapterIc,
    /// Vendor name
    pub vendor: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware version
    pub firmware_version: String,
}

impl Default for AdapterInfo {
    fn default() -> Self {
        Self {
            identification: "???".into(),
            model: "Unspecified".into(),
            ic: AdapterIc::Unknown,
            vendor: "Unknown".into(),
            serial_number: "Unknown".into(),
            firmware_version: "Unknown".into(),
        }
    }
}

/// Behaviour probed during initialisation, used to choose a framing strategy
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdapterCapabilities {
    /// The adapter segments long payloads into ISO-TP frames itself
    pub has_auto_segmentation: bool,
    /// The adapter accepts a short frame with "expect no reply"
    pub has_small_frame_no_response: bool,
    /// The adapter accepts a full 8 byte frame with "expect no reply" when auto formatting is off
    pub has_full_frame_no_response: bool,
    /// See [AdapterIc::maximum_auto_segmentation_frame_length]
    pub maximum_auto_segmentation_frame_length: usize,
}

/// Notification from an adapter to its observers
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// The adapter moved between states
    StateChanged {
        /// Previous state
        from: AdapterState,
        /// New state
        to: AdapterState,
    },
    /// A bus protocol was negotiated and its codec installed
    ProtocolNegotiated(BusProtocol),
    /// A string command completed
    CommandCompleted {
        /// The command
        command: StringCommand,
        /// True if its reply parsed successfully
        success: bool,
    },
}

/// Observer of an adapter. Handlers are called on the thread that drives the adapter
pub trait AdapterEventHandler: Send {
    /// Called for every [AdapterEvent]
    fn on_event(&mut self, event: &AdapterEvent);

    /// Called once with the transport, after it is opened and before any byte is written.
    /// This is the place for out of band configuration such as the baud rate
    fn on_device_initializable(&mut self, _channel: &mut dyn ByteChannel) {}
}

impl AdapterEventHandler for mpsc::Sender<AdapterEvent> {
    fn on_event(&mut self, event: &AdapterEvent) {
        let _ = self.send(event.clone());
    }
}

/// A connected diagnostic adapter, as used by [crate::uds::Pipeline].
///
/// Calls block until the request has been answered (or has failed).
/// Only one request may be in flight at a time, which the pipeline guarantees
/// by sharing adapters behind a mutex.
pub trait Adapter: Send {
    /// Current state
    fn state(&self) -> AdapterState;

    /// Identity of the adapter, once initialisation has completed
    fn info(&self) -> Option<&AdapterInfo>;

    /// Negotiated bus protocol, [BusProtocol::Unknown] until connected
    fn negotiated_protocol(&self) -> BusProtocol;

    /// Largest payload one frame can carry on the negotiated protocol
    fn mtu(&self) -> usize;

    /// Sends `message` and returns the reassembled, decoded reply.
    /// Transient "response pending" frames are dropped along the way
    fn send(&mut self, message: &Message) -> DiagServerResult<Message>;

    /// Sends `message` unencoded and returns every frame of the reply as its own message
    fn send_raw(
        &mut self,
        message: &Message,
        expected_frames: Option<usize>,
    ) -> DiagServerResult<Vec<Message>>;

    /// Forces the adapter into [AdapterState::Gone] and releases the transport
    fn shutdown(&mut self);
}

/// Header filter value meaning "accept replies from any ECU"
pub const RECEIVE_ANY: Header = 0;
