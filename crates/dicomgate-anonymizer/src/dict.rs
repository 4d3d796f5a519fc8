//! Tag keyword resolution for scripts, rules and naming patterns.
//!
//! Scripts reference tags either by keyword (`PatientID`) or as a
//! `GGGG,EEEE` hex pair. The keyword table covers the identifying and
//! acquisition tags the gateway works with; anything else must use hex.

use dicom_core::Tag;
use dicom_dictionary_std::tags;

/// Keywords known to the gateway, with their tags.
pub const KNOWN_TAGS: &[(&str, Tag)] = &[
    ("PatientName", tags::PATIENT_NAME),
    ("PatientID", tags::PATIENT_ID),
    ("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
    ("PatientSex", tags::PATIENT_SEX),
    ("PatientAge", tags::PATIENT_AGE),
    ("PatientAddress", tags::PATIENT_ADDRESS),
    ("PatientTelephoneNumbers", tags::PATIENT_TELEPHONE_NUMBERS),
    ("PatientComments", tags::PATIENT_COMMENTS),
    ("OtherPatientIDs", Tag(0x0010, 0x1000)),
    ("OtherPatientNames", Tag(0x0010, 0x1001)),
    ("IssuerOfPatientID", tags::ISSUER_OF_PATIENT_ID),
    ("AccessionNumber", tags::ACCESSION_NUMBER),
    ("ReferringPhysicianName", tags::REFERRING_PHYSICIAN_NAME),
    ("PerformingPhysicianName", tags::PERFORMING_PHYSICIAN_NAME),
    ("OperatorsName", tags::OPERATORS_NAME),
    ("InstitutionName", tags::INSTITUTION_NAME),
    ("InstitutionAddress", tags::INSTITUTION_ADDRESS),
    ("StationName", tags::STATION_NAME),
    ("StudyDescription", tags::STUDY_DESCRIPTION),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("StudyDate", tags::STUDY_DATE),
    ("SeriesDate", tags::SERIES_DATE),
    ("AcquisitionDate", tags::ACQUISITION_DATE),
    ("ContentDate", tags::CONTENT_DATE),
    ("StudyTime", tags::STUDY_TIME),
    ("StudyID", tags::STUDY_ID),
    ("Modality", tags::MODALITY),
    ("BodyPartExamined", tags::BODY_PART_EXAMINED),
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
    ("SOPClassUID", tags::SOP_CLASS_UID),
    ("FrameOfReferenceUID", tags::FRAME_OF_REFERENCE_UID),
    ("DeviceSerialNumber", tags::DEVICE_SERIAL_NUMBER),
    ("ProtocolName", tags::PROTOCOL_NAME),
];

/// Resolve a keyword or `GGGG,EEEE` hex pair.
pub fn resolve(name: &str) -> Option<Tag> {
    if let Some(tag) = parse_hex(name) {
        return Some(tag);
    }
    KNOWN_TAGS
        .iter()
        .find(|(keyword, _)| *keyword == name)
        .map(|(_, tag)| *tag)
}

/// Keyword for a tag, when known.
pub fn keyword(tag: Tag) -> Option<&'static str> {
    KNOWN_TAGS
        .iter()
        .find(|(_, t)| *t == tag)
        .map(|(keyword, _)| *keyword)
}

fn parse_hex(name: &str) -> Option<Tag> {
    let cleaned = name.trim_start_matches('(').trim_end_matches(')');
    let (group, element) = cleaned.split_once(',')?;
    let group = u16::from_str_radix(group.trim(), 16).ok()?;
    let element = u16::from_str_radix(element.trim(), 16).ok()?;
    Some(Tag(group, element))
}

/// `GGGG,EEEE` rendering used in audit reports.
pub fn tag_hex(tag: Tag) -> String {
    format!("{:04X},{:04X}", tag.group(), tag.element())
}
