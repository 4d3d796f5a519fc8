//! Pixel-region redaction for burned-in PHI. Only native (uncompressed)
//! pixel data can be rewritten in place; a compressed transfer syntax is
//! reported back to the caller as a conformance issue.

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;

/// Zero the rectangle `(x, y, w, h)` in every frame of the object's pixel
/// data. Returns an error string (for the audit report) when the object
/// cannot be rewritten.
pub fn redact_region(
    obj: &mut InMemDicomObject,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
) -> Result<(), String> {
    let rows = read_u32(obj, tags::ROWS).ok_or("missing Rows")?;
    let columns = read_u32(obj, tags::COLUMNS).ok_or("missing Columns")?;
    let bits_allocated = read_u32(obj, tags::BITS_ALLOCATED).unwrap_or(8);
    let samples_per_pixel = read_u32(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1);

    if bits_allocated % 8 != 0 {
        return Err(format!("unsupported BitsAllocated {}", bits_allocated));
    }
    let bytes_per_pixel = (bits_allocated / 8) * samples_per_pixel;

    let element = obj
        .element(tags::PIXEL_DATA)
        .map_err(|_| "missing PixelData".to_string())?;
    let mut data = element
        .to_bytes()
        .map_err(|e| format!("pixel data is not native: {}", e))?
        .into_owned();

    let frame_size = (rows * columns * bytes_per_pixel) as usize;
    if frame_size == 0 || data.len() < frame_size {
        return Err("pixel data shorter than one frame".into());
    }
    let frames = data.len() / frame_size;

    let x_end = (x + w).min(columns);
    let y_end = (y + h).min(rows);
    if x >= columns || y >= rows {
        return Ok(());
    }

    for frame in 0..frames {
        let base = frame * frame_size;
        for row in y..y_end {
            let row_start = base + (row * columns + x) as usize * bytes_per_pixel as usize;
            let row_end = base + (row * columns + x_end) as usize * bytes_per_pixel as usize;
            data[row_start..row_end].fill(0);
        }
    }

    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::from(data),
    ));
    Ok(())
}

fn read_u32(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u32> {
    obj.element(tag).ok()?.to_int::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::Tag;

    fn image(rows: u16, columns: u16, fill: u8) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            PrimitiveValue::from(columns),
        ));
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            PrimitiveValue::from(8u16),
        ));
        obj.put(DataElement::new(
            tags::SAMPLES_PER_PIXEL,
            VR::US,
            PrimitiveValue::from(1u16),
        ));
        let data = vec![fill; rows as usize * columns as usize];
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::from(data),
        ));
        obj
    }

    fn pixels(obj: &InMemDicomObject) -> Vec<u8> {
        obj.element(tags::PIXEL_DATA)
            .unwrap()
            .to_bytes()
            .unwrap()
            .into_owned()
    }

    #[test]
    fn test_rectangle_zeroed_rest_untouched() {
        let mut obj = image(8, 8, 0xFF);
        redact_region(&mut obj, 2, 2, 3, 3).unwrap();
        let data = pixels(&obj);
        // inside
        assert_eq!(data[2 * 8 + 2], 0);
        assert_eq!(data[4 * 8 + 4], 0);
        // outside
        assert_eq!(data[0], 0xFF);
        assert_eq!(data[5 * 8 + 5], 0xFF);
        assert_eq!(data[2 * 8 + 5], 0xFF);
    }

    #[test]
    fn test_region_clamped_to_image() {
        let mut obj = image(4, 4, 0xFF);
        redact_region(&mut obj, 2, 2, 100, 100).unwrap();
        let data = pixels(&obj);
        assert_eq!(data[3 * 4 + 3], 0);
        assert_eq!(data[0], 0xFF);
    }

    #[test]
    fn test_region_fully_outside_is_noop() {
        let mut obj = image(4, 4, 0xFF);
        redact_region(&mut obj, 10, 10, 2, 2).unwrap();
        assert!(pixels(&obj).iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_missing_pixel_data_reported() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(4u16)));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            PrimitiveValue::from(4u16),
        ));
        let err = redact_region(&mut obj, 0, 0, 1, 1).unwrap_err();
        assert!(err.contains("PixelData"));
    }

    #[test]
    fn test_missing_dimensions_reported() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            Tag(0x7FE0, 0x0010),
            VR::OW,
            PrimitiveValue::from(vec![0u8; 16]),
        ));
        assert!(redact_region(&mut obj, 0, 0, 1, 1).is_err());
    }
}
