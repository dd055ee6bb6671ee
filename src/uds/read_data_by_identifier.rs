//! Provides methods to read, write and dynamically define data identifiers

use super::{
    DiagnosticSession, FromMessage, GenericResponse, Message, Service,
    responses::{ascii_char, require_len},
};
use crate::DiagServerResult;

/// Data identifiers standardized by ISO14229-1. Everything else is vendor specific
pub mod well_known {
    /// Boot software identification
    pub const BOOT_SOFTWARE_IDENTIFICATION: u16 = 0xF180;
    /// Application software identification
    pub const APPLICATION_SOFTWARE_IDENTIFICATION: u16 = 0xF181;
    /// Application data identification
    pub const APPLICATION_DATA_IDENTIFICATION: u16 = 0xF182;
    /// Boot software fingerprint
    pub const BOOT_SOFTWARE_FINGERPRINT: u16 = 0xF183;
    /// Application software fingerprint
    pub const APPLICATION_SOFTWARE_FINGERPRINT: u16 = 0xF184;
    /// Application data fingerprint
    pub const APPLICATION_DATA_FINGERPRINT: u16 = 0xF185;
    /// Active diagnostic session
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
    /// Vehicle manufacturer spare part number
    pub const VEHICLE_MANUFACTURER_SPARE_PART_NUMBER: u16 = 0xF187;
    /// Vehicle manufacturer ECU software number
    pub const VEHICLE_MANUFACTURER_ECU_SOFTWARE_NUMBER: u16 = 0xF188;
    /// Vehicle manufacturer ECU software version number
    pub const VEHICLE_MANUFACTURER_ECU_SOFTWARE_VERSION_NUMBER: u16 = 0xF189;
    /// System supplier identifier
    pub const SYSTEM_SUPPLIER_IDENTIFIER: u16 = 0xF18A;
    /// ECU manufacturing date
    pub const ECU_MANUFACTURING_DATE: u16 = 0xF18B;
    /// ECU serial number
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    /// Supported functional units
    pub const SUPPORTED_FUNCTIONAL_UNITS: u16 = 0xF18D;
    /// Vehicle manufacturer kit assembly part number
    pub const VEHICLE_MANUFACTURER_KIT_ASSEMBLY_PART_NUMBER: u16 = 0xF18E;
    /// Regulation X software identification numbers
    pub const REGULATION_X_SOFTWARE_IDENTIFICATION_NUMBERS: u16 = 0xF18F;
    /// Vehicle identification number
    pub const VIN: u16 = 0xF190;
    /// Vehicle manufacturer ECU hardware number
    pub const VEHICLE_MANUFACTURER_ECU_HARDWARE_NUMBER: u16 = 0xF191;
    /// System supplier ECU hardware number
    pub const SYSTEM_SUPPLIER_ECU_HARDWARE_NUMBER: u16 = 0xF192;
    /// System supplier ECU hardware version number
    pub const SYSTEM_SUPPLIER_ECU_HARDWARE_VERSION_NUMBER: u16 = 0xF193;
    /// System supplier ECU software number
    pub const SYSTEM_SUPPLIER_ECU_SOFTWARE_NUMBER: u16 = 0xF194;
    /// System supplier ECU software version number
    pub const SYSTEM_SUPPLIER_ECU_SOFTWARE_VERSION_NUMBER: u16 = 0xF195;
    /// Exhaust regulation or type approval number
    pub const EXHAUST_REGULATION_OR_TYPE_APPROVAL_NUMBER: u16 = 0xF196;
    /// System name or engine type
    pub const SYSTEM_NAME_OR_ENGINE_TYPE: u16 = 0xF197;
    /// Repair shop code or tester serial number
    pub const REPAIR_SHOP_CODE_OR_TESTER_SERIAL_NUMBER: u16 = 0xF198;
    /// Programming date
    pub const PROGRAMMING_DATE: u16 = 0xF199;
    /// Calibration repair shop code or calibration equipment serial number
    pub const CALIBRATION_REPAIR_SHOP_CODE: u16 = 0xF19A;
    /// Calibration date
    pub const CALIBRATION_DATE: u16 = 0xF19B;
    /// Calibration equipment software number
    pub const CALIBRATION_EQUIPMENT_SOFTWARE_NUMBER: u16 = 0xF19C;
    /// ECU installation date
    pub const ECU_INSTALLATION_DATE: u16 = 0xF19D;
    /// ODX file
    pub const ODX_FILE: u16 = 0xF19E;
    /// Entity
    pub const ENTITY: u16 = 0xF19F;
    /// Number of EDR devices
    pub const NUMBER_OF_EDR_DEVICES: u16 = 0xFA10;
    /// EDR identification
    pub const EDR_IDENTIFICATION: u16 = 0xFA11;
    /// EDR device address information
    pub const EDR_DEVICE_ADDRESS_INFORMATION: u16 = 0xFA12;
    /// UDS version
    pub const UDS_VERSION: u16 = 0xFF00;
}

/// A data record together with its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataIdentifierResponse {
    /// Identifier echoed by the ECU
    pub id: u16,
    /// Data record
    pub record: Vec<u8>,
}

impl DataIdentifierResponse {
    /// The record as text, with non printable bytes shown as `.`
    pub fn ascii(&self) -> String {
        self.record.iter().map(|b| ascii_char(*b)).collect()
    }
}

impl FromMessage for DataIdentifierResponse {
    fn from_message(message: &Message) -> DiagServerResult<Self> {
        require_len(message, 3)?;
        let b = message.bytes();
        Ok(Self {
            id: u16::from_be_bytes([b[1], b[2]]),
            record: b[3..].to_vec(),
        })
    }
}

impl DiagnosticSession {
    /// Reads the record of data identifier `id`
    pub fn read_data_by_identifier(&self, id: u16) -> DiagServerResult<DataIdentifierResponse> {
        self.request(&Service::ReadDataByIdentifier(id))
    }

    /// Writes `record` to data identifier `id`
    pub fn write_data_by_identifier(&self, id: u16, record: &[u8]) -> DiagServerResult<GenericResponse> {
        self.request(&Service::WriteDataByIdentifier {
            id,
            data: record.to_vec(),
        })
    }

    /// Defines `id` as `size` bytes of `source_id`, starting at the 1 based `position`
    pub fn define_data_identifier(
        &self,
        id: u16,
        source_id: u16,
        position: u8,
        size: u8,
    ) -> DiagServerResult<GenericResponse> {
        self.request(&Service::DynamicallyDefineDataIdentifier {
            id,
            source_id,
            position,
            size,
        })
    }

    /// Clears a dynamically defined identifier, or all of them if `id` is `None`
    pub fn clear_dynamically_defined_data_identifier(&self, id: Option<u16>) -> DiagServerResult<GenericResponse> {
        match id {
            Some(id) => self.request(&Service::ClearDynamicallyDefinedDataIdentifier(id)),
            None => self.request(&Service::ClearAllDynamicallyDefinedDataIdentifiers),
        }
    }
}
