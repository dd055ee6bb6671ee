//! Every diagnostic service this crate can issue, and its request PDU

use automotive_diag::uds::UdsCommand;

use super::{
    DiagnosticSessionType, EcuResetType, RoutineControlType, TesterPresentType,
    MAX_TRANSFER_DATA_LENGTH,
};
use crate::{dtc::DtcStatusMask, obd2::Obd2Command};

/// A diagnostic request with its parameters.
///
/// [Service::payload] serializes it. A parameter violation (wrong security level parity,
/// oversize transfer, nibble overflow) produces an empty payload, which the pipeline rejects
/// with [crate::DiagError::MalformedService].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Service {
    /// OBD2 service 01
    CurrentData(u8),
    /// OBD2 service 02
    FreezeFrameData {
        /// PID
        pid: u8,
        /// Freeze frame number
        frame: u8,
    },
    /// OBD2 service 03
    StoredDtcs,
    /// OBD2 service 04
    ResetDtcs,
    /// OBD2 service 05
    OxygenSensorMonitoring(u8),
    /// OBD2 service 06
    ComponentMonitoring(u8),
    /// OBD2 service 07
    PendingDtcs,
    /// OBD2 service 08
    TriggerControlOperation(u8),
    /// OBD2 service 09
    VehicleInformation(u8),
    /// OBD2 service 0A
    PermanentDtcs,

    /// Clears DTCs of a group (24 bit, `0xFFFFFF` = all)
    ClearDiagnosticInformation(u32),
    /// Clears every dynamically defined data identifier
    ClearAllDynamicallyDefinedDataIdentifiers,
    /// Clears one dynamically defined data identifier
    ClearDynamicallyDefinedDataIdentifier(u16),
    /// Defines `id` as `size` bytes of `source_id` starting at `position` (1 based)
    DynamicallyDefineDataIdentifier {
        /// Identifier being defined
        id: u16,
        /// Source identifier
        source_id: u16,
        /// Position of the first byte within the source record
        position: u8,
        /// Number of bytes
        size: u8,
    },
    /// Switches the diagnostic session
    DiagnosticSessionControl(DiagnosticSessionType),
    /// Resets the ECU
    EcuReset(EcuResetType),
    /// Reads a data identifier
    ReadDataByIdentifier(u16),
    /// Reports DTCs whose status matches the mask
    ReadDtcByStatusMask(DtcStatusMask),
    /// Starts a download (tester to ECU) of `length` bytes to `address`
    RequestDownload {
        /// Compression method nibble
        compression: u8,
        /// Encryption method nibble
        encryption: u8,
        /// Memory address, big endian, 1 to 15 bytes
        address: Vec<u8>,
        /// Memory size, big endian, 1 to 15 bytes
        length: Vec<u8>,
    },
    /// Ends a transfer, with an optional transfer request parameter record (e.g. a checksum)
    RequestTransferExit(Vec<u8>),
    /// Starts, stops or queries a routine
    RoutineControl {
        /// Sub function
        control_type: RoutineControlType,
        /// Routine identifier
        id: u16,
        /// Routine option record
        parameters: Vec<u8>,
    },
    /// Asks for the seed of an (odd) security level
    SecurityAccessRequestSeed(u8),
    /// Sends the key for an (even) security level
    SecurityAccessSendKey {
        /// Security level
        level: u8,
        /// Computed key
        key: Vec<u8>,
    },
    /// Keeps a non default session alive
    TesterPresent(TesterPresentType),
    /// One block of a transfer
    TransferData {
        /// Block sequence counter
        sequence: u8,
        /// Block data
        data: Vec<u8>,
    },
    /// Writes a data identifier
    WriteDataByIdentifier {
        /// Identifier
        id: u16,
        /// Record
        data: Vec<u8>,
    },
    /// Enables or disables message transmission / reception
    CommunicationControl {
        /// Sub function (control type)
        control_type: u8,
        /// Communication type
        communication_type: u8,
    },
}

impl Service {
    /// Service ID the request starts with
    pub fn service_id(&self) -> u8 {
        match self {
            Self::CurrentData(_) => Obd2Command::Service01.into(),
            Self::FreezeFrameData { .. } => Obd2Command::Service02.into(),
            Self::StoredDtcs => Obd2Command::Service03.into(),
            Self::ResetDtcs => Obd2Command::Service04.into(),
            Self::OxygenSensorMonitoring(_) => Obd2Command::Service05.into(),
            Self::ComponentMonitoring(_) => Obd2Command::Service06.into(),
            Self::PendingDtcs => Obd2Command::Service07.into(),
            Self::TriggerControlOperation(_) => Obd2Command::Service08.into(),
            Self::VehicleInformation(_) => Obd2Command::Service09.into(),
            Self::PermanentDtcs => Obd2Command::Service0A.into(),
            Self::ClearDiagnosticInformation(_) => UdsCommand::ClearDiagnosticInformation.into(),
            Self::ClearAllDynamicallyDefinedDataIdentifiers
            | Self::ClearDynamicallyDefinedDataIdentifier(_)
            | Self::DynamicallyDefineDataIdentifier { .. } => {
                UdsCommand::DynamicallyDefineDataIdentifier.into()
            }
            Self::DiagnosticSessionControl(_) => UdsCommand::DiagnosticSessionControl.into(),
            Self::EcuReset(_) => UdsCommand::ECUReset.into(),
            Self::ReadDataByIdentifier(_) => UdsCommand::ReadDataByIdentifier.into(),
            Self::ReadDtcByStatusMask(_) => UdsCommand::ReadDTCInformation.into(),
            Self::RequestDownload { .. } => UdsCommand::RequestDownload.into(),
            Self::RequestTransferExit(_) => UdsCommand::RequestTransferExit.into(),
            Self::RoutineControl { .. } => UdsCommand::RoutineControl.into(),
            Self::SecurityAccessRequestSeed(_) | Self::SecurityAccessSendKey { .. } => {
                UdsCommand::SecurityAccess.into()
            }
            Self::TesterPresent(_) => UdsCommand::TesterPresent.into(),
            Self::TransferData { .. } => UdsCommand::TransferData.into(),
            Self::WriteDataByIdentifier { .. } => UdsCommand::WriteDataByIdentifier.into(),
            Self::CommunicationControl { .. } => UdsCommand::CommunicationControl.into(),
        }
    }

    /// Serializes the request. Empty if a parameter is out of range
    pub fn payload(&self) -> Vec<u8> {
        let sid = self.service_id();
        let mut p = vec![sid];
        match self {
            Self::StoredDtcs
            | Self::ResetDtcs
            | Self::PendingDtcs
            | Self::PermanentDtcs => {}
            Self::CurrentData(pid)
            | Self::OxygenSensorMonitoring(pid)
            | Self::ComponentMonitoring(pid)
            | Self::TriggerControlOperation(pid)
            | Self::VehicleInformation(pid) => p.push(*pid),
            Self::FreezeFrameData { pid, frame } => p.extend_from_slice(&[*pid, *frame]),
            Self::ClearDiagnosticInformation(group) => {
                if *group > 0xFF_FFFF {
                    return Vec::new();
                }
                p.extend_from_slice(&group.to_be_bytes()[1..]);
            }
            Self::ClearAllDynamicallyDefinedDataIdentifiers => p.push(0x03),
            Self::ClearDynamicallyDefinedDataIdentifier(id) => {
                p.push(0x03);
                p.extend_from_slice(&id.to_be_bytes());
            }
            Self::DynamicallyDefineDataIdentifier {
                id,
                source_id,
                position,
                size,
            } => {
                p.push(0x01);
                p.extend_from_slice(&id.to_be_bytes());
                p.extend_from_slice(&source_id.to_be_bytes());
                p.extend_from_slice(&[*position, *size]);
            }
            Self::DiagnosticSessionControl(t) => p.push((*t).into()),
            Self::EcuReset(t) => p.push((*t).into()),
            Self::ReadDataByIdentifier(id) => p.extend_from_slice(&id.to_be_bytes()),
            Self::ReadDtcByStatusMask(mask) => p.extend_from_slice(&[0x02, mask.bits()]),
            Self::RequestDownload {
                compression,
                encryption,
                address,
                length,
            } => {
                if *compression > 0x0F
                    || *encryption > 0x0F
                    || !(1..0x10).contains(&address.len())
                    || !(1..0x10).contains(&length.len())
                {
                    return Vec::new();
                }
                p.push(compression << 4 | encryption);
                p.push((length.len() as u8) << 4 | address.len() as u8);
                p.extend_from_slice(address);
                p.extend_from_slice(length);
            }
            Self::RoutineControl {
                control_type,
                id,
                parameters,
            } => {
                p.push((*control_type).into());
                p.extend_from_slice(&id.to_be_bytes());
                p.extend_from_slice(parameters);
            }
            Self::SecurityAccessRequestSeed(level) => {
                if *level >= 0x7F || level % 2 == 0 {
                    return Vec::new();
                }
                p.push(*level);
            }
            Self::SecurityAccessSendKey { level, key } => {
                if *level >= 0x7F || level % 2 != 0 || *level == 0 {
                    return Vec::new();
                }
                p.push(*level);
                p.extend_from_slice(key);
            }
            Self::TesterPresent(t) => p.push((*t).into()),
            Self::TransferData { sequence, data } => {
                if data.len() > MAX_TRANSFER_DATA_LENGTH {
                    return Vec::new();
                }
                p.push(*sequence);
                p.extend_from_slice(data);
            }
            Self::RequestTransferExit(record) => p.extend_from_slice(record),
            Self::WriteDataByIdentifier { id, data } => {
                p.extend_from_slice(&id.to_be_bytes());
                p.extend_from_slice(data);
            }
            Self::CommunicationControl {
                control_type,
                communication_type,
            } => p.extend_from_slice(&[*control_type, *communication_type]),
        }
        p
    }
}
