//! Module for OBD2 (SAE J1979)
//!
//! OBD2 requests go to the functional broadcast address of the negotiated bus protocol and
//! accept a reply from any ECU.

use std::sync::PoisonError;

use crate::{
    DiagError, DiagServerResult,
    dtc::{Dtc, DtcStorageArea},
    hardware::RECEIVE_ANY,
    uds::{
        DiagnosticSession, DtcResponse, FromMessage, Message, POSITIVE_RESPONSE_OFFSET, Pipeline,
        Service,
    },
};

/// OBD2 service IDs
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::EnumIter, strum_macros::IntoStaticStr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Obd2Command {
    /// Current powertrain data
    Service01,
    /// Freeze frame data
    Service02,
    /// Stored (confirmed) DTCs
    Service03,
    /// Clear DTCs and stored values
    Service04,
    /// Oxygen sensor monitoring test results
    Service05,
    /// On board monitoring test results
    Service06,
    /// Pending DTCs
    Service07,
    /// Control of an on board system, test or component
    Service08,
    /// Vehicle information
    Service09,
    /// Permanent DTCs
    Service0A,
}

impl From<Obd2Command> for u8 {
    fn from(c: Obd2Command) -> Self {
        match c {
            Obd2Command::Service01 => 0x01,
            Obd2Command::Service02 => 0x02,
            Obd2Command::Service03 => 0x03,
            Obd2Command::Service04 => 0x04,
            Obd2Command::Service05 => 0x05,
            Obd2Command::Service06 => 0x06,
            Obd2Command::Service07 => 0x07,
            Obd2Command::Service08 => 0x08,
            Obd2Command::Service09 => 0x09,
            Obd2Command::Service0A => 0x0A,
        }
    }
}

/// Service 09 info type of the vehicle identification number
pub const VEHICLE_INFO_VIN: u8 = 0x02;

/// Length of a vehicle identification number
const VIN_LENGTH: usize = 17;

/// Reply to an OBD2 service that addresses a PID
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Obd2Response {
    /// Service that was answered
    pub service: u8,
    /// PID (or info type) that was answered
    pub pid: u8,
    /// Bytes following the PID
    pub data: Vec<u8>,
}

impl Obd2Response {
    /// Decodes a "supported PIDs" bitmask reply (PIDs 0x00, 0x20, ...), returning every
    /// PID it marks as supported. Empty for any other PID
    pub fn supported_pids(&self) -> Vec<u8> {
        if self.pid % 0x20 != 0 {
            return Vec::new();
        }
        let mut pids = Vec::new();
        for (byte_index, byte) in self.data.iter().take(4).enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) == 0 {
                    continue;
                }
                if let Some(pid) = self.pid.checked_add((byte_index * 8 + bit) as u8 + 1) {
                    pids.push(pid);
                }
            }
        }
        pids
    }

    /// The data as text, with anything but printable ASCII removed
    pub fn as_string(&self) -> String {
        self.data
            .iter()
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|b| *b as char)
            .collect()
    }
}

impl FromMessage for Obd2Response {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        let b = message.bytes();
        if b.len() < 2 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(Self {
            service: b[0] & !POSITIVE_RESPONSE_OFFSET,
            pid: b[1],
            data: b[2..].to_vec(),
        })
    }
}

/// Session for OBD2 requests on the broadcast header
#[derive(Debug)]
pub struct Obd2Session {
    session: DiagnosticSession,
}

impl Obd2Session {
    /// Creates a session on the broadcast header of the adapter's negotiated protocol
    pub fn new(pipeline: Pipeline) -> Self {
        let adapter = pipeline.adapter();
        let protocol = adapter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .negotiated_protocol();
        let header = protocol
            .broadcast_header()
            .unwrap_or(crate::bus::BROADCAST_11_BIT);
        Self {
            session: DiagnosticSession::new(header, Some(RECEIVE_ANY), pipeline),
        }
    }

    /// Header requests are sent on
    pub fn header(&self) -> crate::Header {
        self.session.id()
    }

    /// Reads the DTCs kept in `area`
    pub fn read_dtcs(&self, area: DtcStorageArea) -> DiagServerResult<Vec<Dtc>> {
        let service = match area {
            DtcStorageArea::Stored => Service::StoredDtcs,
            DtcStorageArea::Pending => Service::PendingDtcs,
            DtcStorageArea::Permanent => Service::PermanentDtcs,
        };
        let response: DtcResponse = self.session.request(&service)?;
        Ok(response.dtcs)
    }

    /// Clears DTCs and the stored diagnostic values
    pub fn clear_dtcs(&self) -> DiagServerResult<()> {
        self.session.request::<Message>(&Service::ResetDtcs).map(|_| ())
    }

    /// Sends a PID based service and returns its reply
    pub fn read(&self, service: &Service) -> DiagServerResult<Obd2Response> {
        self.session.request(service)
    }

    /// Reads the vehicle identification number
    pub fn read_vin(&self) -> DiagServerResult<String> {
        let response = self.read(&Service::VehicleInformation(VEHICLE_INFO_VIN))?;
        // CAN replies put a data item count in front of the VIN
        let vin: String = response.as_string().chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if vin.len() < VIN_LENGTH {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(vin[vin.len() - VIN_LENGTH..].to_string())
    }
}
