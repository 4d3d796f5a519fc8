use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use dicomgate_config::TagValues;
use dicomgate_types::InstanceMeta;
use std::path::PathBuf;

/// Tags surfaced to rules, naming patterns and XNAT templates.
const EXTRACTED: &[(&str, Tag)] = &[
    ("PatientID", tags::PATIENT_ID),
    ("PatientName", tags::PATIENT_NAME),
    ("PatientSex", tags::PATIENT_SEX),
    ("StudyDate", tags::STUDY_DATE),
    ("StudyTime", tags::STUDY_TIME),
    ("StudyDescription", tags::STUDY_DESCRIPTION),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("Modality", tags::MODALITY),
    ("BodyPartExamined", tags::BODY_PART_EXAMINED),
    ("StationName", tags::STATION_NAME),
    ("InstitutionName", tags::INSTITUTION_NAME),
    ("AccessionNumber", tags::ACCESSION_NUMBER),
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
    ("SOPClassUID", tags::SOP_CLASS_UID),
];

fn value_of(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|v| v.trim().trim_end_matches('\0').to_string())
        .filter(|v| !v.is_empty())
}

/// Extract the rule-visible tag values of one instance.
pub fn tag_values(obj: &InMemDicomObject) -> TagValues {
    let mut values = TagValues::new();
    for (keyword, tag) in EXTRACTED {
        if let Some(value) = value_of(obj, *tag) {
            values.insert((*keyword).to_string(), value);
        }
    }
    values
}

/// Build the instance metadata record stored in the study manifest.
pub fn instance_meta(obj: &InMemDicomObject, path: PathBuf, file_size: u64) -> InstanceMeta {
    InstanceMeta {
        path,
        sop_instance_uid: value_of(obj, tags::SOP_INSTANCE_UID).unwrap_or_default(),
        sop_class_uid: value_of(obj, tags::SOP_CLASS_UID).unwrap_or_default(),
        series_instance_uid: value_of(obj, tags::SERIES_INSTANCE_UID).unwrap_or_default(),
        modality: value_of(obj, tags::MODALITY),
        patient_id: value_of(obj, tags::PATIENT_ID),
        patient_name: value_of(obj, tags::PATIENT_NAME),
        study_date: value_of(obj, tags::STUDY_DATE),
        file_size,
    }
}

/// Study Instance UID of an instance, if present.
pub fn study_uid(obj: &InMemDicomObject) -> Option<String> {
    value_of(obj, tags::STUDY_INSTANCE_UID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};

    fn test_object() -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("P12345"),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from("CT"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3"),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3.4"),
        ));
        obj
    }

    #[test]
    fn test_tag_values() {
        let values = tag_values(&test_object());
        assert_eq!(values["PatientID"], "P12345");
        assert_eq!(values["Modality"], "CT");
        assert!(!values.contains_key("StudyDate"));
    }

    #[test]
    fn test_instance_meta() {
        let meta = instance_meta(&test_object(), "a.dcm".into(), 42);
        assert_eq!(meta.sop_instance_uid, "1.2.3.4");
        assert_eq!(meta.patient_id.as_deref(), Some("P12345"));
        assert_eq!(meta.file_size, 42);
    }

    #[test]
    fn test_study_uid() {
        assert_eq!(study_uid(&test_object()).as_deref(), Some("1.2.3"));
        assert!(study_uid(&InMemDicomObject::new_empty()).is_none());
    }
}
