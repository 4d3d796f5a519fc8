//! DIMSE command sets for the verification and storage services.
//!
//! Command sets always travel in Implicit VR Little Endian regardless of
//! the negotiated data-set transfer syntax. Builders here include the
//! command group length element required by the standard; parsers tolerate
//! its absence.

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_object::mem::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use thiserror::Error;

/// Verification SOP Class (C-ECHO)
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
/// Implicit VR Little Endian, the command-set transfer syntax
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Command field values used by the gateway.
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// CommandDataSetType: no data set follows the command
pub const NO_DATA_SET: u16 = 0x0101;
/// CommandDataSetType: a data set follows
pub const HAS_DATA_SET: u16 = 0x0000;

pub const STATUS_SUCCESS: u16 = 0x0000;
/// Out-of-resources class used when the SCP cannot store an instance
pub const STATUS_PROCESSING_FAILURE: u16 = 0x0110;

#[derive(Debug, Error)]
pub enum DimseError {
    #[error("cannot encode command set: {0}")]
    Encode(String),

    #[error("cannot decode command set: {0}")]
    Decode(String),

    #[error("command set is missing element {0}")]
    MissingElement(Tag),
}

fn str_element(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

fn us_element(tag: Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

/// C-ECHO-RQ command set.
pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(
        dicom_dictionary_std::tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        VERIFICATION_SOP_CLASS,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_FIELD,
        command_field::C_ECHO_RQ,
    ));
    obj.put(us_element(dicom_dictionary_std::tags::MESSAGE_ID, message_id));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_DATA_SET_TYPE,
        NO_DATA_SET,
    ));
    obj
}

/// C-ECHO-RSP command set.
pub fn echo_rsp(message_id: u16, status: u16) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(
        dicom_dictionary_std::tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        VERIFICATION_SOP_CLASS,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_FIELD,
        command_field::C_ECHO_RSP,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::MESSAGE_ID_BEING_RESPONDED_TO,
        message_id,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_DATA_SET_TYPE,
        NO_DATA_SET,
    ));
    obj.put(us_element(dicom_dictionary_std::tags::STATUS, status));
    obj
}

/// C-STORE-RQ command set for one instance.
pub fn store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: u16,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(
        dicom_dictionary_std::tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        sop_class_uid,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_FIELD,
        command_field::C_STORE_RQ,
    ));
    obj.put(us_element(dicom_dictionary_std::tags::MESSAGE_ID, message_id));
    obj.put(us_element(dicom_dictionary_std::tags::PRIORITY, priority));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_DATA_SET_TYPE,
        HAS_DATA_SET,
    ));
    obj.put(str_element(
        dicom_dictionary_std::tags::AFFECTED_SOP_INSTANCE_UID,
        VR::UI,
        sop_instance_uid,
    ));
    obj
}

/// C-STORE-RSP command set.
pub fn store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(
        dicom_dictionary_std::tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        sop_class_uid,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_FIELD,
        command_field::C_STORE_RSP,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::MESSAGE_ID_BEING_RESPONDED_TO,
        message_id,
    ));
    obj.put(us_element(
        dicom_dictionary_std::tags::COMMAND_DATA_SET_TYPE,
        NO_DATA_SET,
    ));
    obj.put(us_element(dicom_dictionary_std::tags::STATUS, status));
    obj.put(str_element(
        dicom_dictionary_std::tags::AFFECTED_SOP_INSTANCE_UID,
        VR::UI,
        sop_instance_uid,
    ));
    obj
}

/// Serialize a command set, prepending the command group length element.
pub fn encode_command(obj: &InMemDicomObject) -> Result<Vec<u8>, DimseError> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut body = Vec::new();
    obj.write_dataset_with_ts(&mut body, &ts)
        .map_err(|e| DimseError::Encode(e.to_string()))?;

    let mut group_length = InMemDicomObject::new_empty();
    group_length.put(DataElement::new(
        dicom_dictionary_std::tags::COMMAND_GROUP_LENGTH,
        VR::UL,
        PrimitiveValue::from(body.len() as u32),
    ));
    let mut out = Vec::with_capacity(body.len() + 12);
    group_length
        .write_dataset_with_ts(&mut out, &ts)
        .map_err(|e| DimseError::Encode(e.to_string()))?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse a received command set fragment.
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject, DimseError> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(data, &ts)
        .map_err(|e| DimseError::Decode(e.to_string()))
}

fn get_u16(obj: &InMemDicomObject, tag: Tag) -> Result<u16, DimseError> {
    obj.element(tag)
        .map_err(|_| DimseError::MissingElement(tag))?
        .to_int::<u16>()
        .map_err(|e| DimseError::Decode(e.to_string()))
}

fn get_str(obj: &InMemDicomObject, tag: Tag) -> Result<String, DimseError> {
    Ok(obj
        .element(tag)
        .map_err(|_| DimseError::MissingElement(tag))?
        .to_str()
        .map_err(|e| DimseError::Decode(e.to_string()))?
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

pub fn command_field_of(obj: &InMemDicomObject) -> Result<u16, DimseError> {
    get_u16(obj, dicom_dictionary_std::tags::COMMAND_FIELD)
}

pub fn message_id_of(obj: &InMemDicomObject) -> Result<u16, DimseError> {
    get_u16(obj, dicom_dictionary_std::tags::MESSAGE_ID)
}

pub fn status_of(obj: &InMemDicomObject) -> Result<u16, DimseError> {
    get_u16(obj, dicom_dictionary_std::tags::STATUS)
}

pub fn affected_sop_class_of(obj: &InMemDicomObject) -> Result<String, DimseError> {
    get_str(obj, dicom_dictionary_std::tags::AFFECTED_SOP_CLASS_UID)
}

pub fn affected_sop_instance_of(obj: &InMemDicomObject) -> Result<String, DimseError> {
    get_str(obj, dicom_dictionary_std::tags::AFFECTED_SOP_INSTANCE_UID)
}

/// Whether a command set announces a following data set.
pub fn has_data_set(obj: &InMemDicomObject) -> bool {
    get_u16(obj, dicom_dictionary_std::tags::COMMAND_DATA_SET_TYPE)
        .map(|v| v != NO_DATA_SET)
        .unwrap_or(false)
}

/// DIMSE status classification for the retry policy: the 0xCxxx "unable to
/// process" class is worth retrying, the 0xAxxx refused/no-resources class
/// is not.
pub fn status_is_success(status: u16) -> bool {
    status == STATUS_SUCCESS
}

pub fn status_is_warning(status: u16) -> bool {
    matches!(status, 0x0001 | 0x0107 | 0x0116) || (status & 0xF000) == 0xB000
}

pub fn status_is_transient(status: u16) -> bool {
    (status & 0xF000) == 0xC000 || status == 0x0122
}

pub fn status_is_permanent(status: u16) -> bool {
    (status & 0xF000) == 0xA000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_round_trip() {
        let rq = echo_rq(7);
        let bytes = encode_command(&rq).unwrap();
        let parsed = decode_command(&bytes).unwrap();
        assert_eq!(command_field_of(&parsed).unwrap(), command_field::C_ECHO_RQ);
        assert_eq!(message_id_of(&parsed).unwrap(), 7);
        assert!(!has_data_set(&parsed));
        assert_eq!(
            affected_sop_class_of(&parsed).unwrap(),
            VERIFICATION_SOP_CLASS
        );
    }

    #[test]
    fn test_store_rq_round_trip() {
        let rq = store_rq(3, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", 0);
        let bytes = encode_command(&rq).unwrap();
        let parsed = decode_command(&bytes).unwrap();
        assert_eq!(command_field_of(&parsed).unwrap(), command_field::C_STORE_RQ);
        assert!(has_data_set(&parsed));
        assert_eq!(affected_sop_instance_of(&parsed).unwrap(), "1.2.3.4");
    }

    #[test]
    fn test_store_rsp_status() {
        let rsp = store_rsp(3, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", STATUS_SUCCESS);
        let bytes = encode_command(&rsp).unwrap();
        let parsed = decode_command(&bytes).unwrap();
        assert!(status_is_success(status_of(&parsed).unwrap()));
    }

    #[test]
    fn test_status_classes() {
        assert!(status_is_transient(0xC001));
        assert!(status_is_transient(0x0122));
        assert!(status_is_permanent(0xA700));
        assert!(!status_is_transient(0xA700));
        assert!(status_is_warning(0xB000));
        assert!(status_is_success(0x0000));
    }
}
