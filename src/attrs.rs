//! Small helpers for reading and writing data elements of in-memory
//! DICOM objects, so that string-keyed attribute access does not leak
//! into the core logic.

use dicom::core::smallvec::SmallVec;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::InMemDicomObject;

use crate::error::{Result, SegmentationError};

pub(crate) type Item = InMemDicomObject;

fn clean(s: &str) -> String {
    s.trim_end_matches(['\0', ' ']).to_string()
}

pub(crate) fn string(obj: &Item, tag: Tag) -> Option<String> {
    let el = obj.element(tag).ok()?;
    el.to_str().ok().map(|s| clean(&s))
}

/// Read a mandatory string attribute, failing with an integrity error.
pub(crate) fn require_string(obj: &Item, tag: Tag, keyword: &str) -> Result<String> {
    string(obj, tag)
        .ok_or_else(|| SegmentationError::Integrity(format!("missing attribute {keyword}")))
}

pub(crate) fn u16_value(obj: &Item, tag: Tag) -> Option<u16> {
    obj.element(tag).ok()?.to_int::<u16>().ok()
}

pub(crate) fn u32_value(obj: &Item, tag: Tag) -> Option<u32> {
    obj.element(tag).ok()?.to_int::<u32>().ok()
}

pub(crate) fn i32_value(obj: &Item, tag: Tag) -> Option<i32> {
    obj.element(tag).ok()?.to_int::<i32>().ok()
}

pub(crate) fn f64_list(obj: &Item, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok()?.to_multi_float64().ok()
}

pub(crate) fn u32_list(obj: &Item, tag: Tag) -> Option<Vec<u32>> {
    obj.element(tag).ok()?.to_multi_int::<u32>().ok()
}

pub(crate) fn i32_list(obj: &Item, tag: Tag) -> Option<Vec<i32>> {
    obj.element(tag).ok()?.to_multi_int::<i32>().ok()
}

pub(crate) fn items<'a>(obj: &'a Item, tag: Tag) -> Option<&'a [Item]> {
    obj.element(tag).ok()?.value().items()
}

/// Read a single attribute-tag (VR AT) value.
pub(crate) fn tag_value(obj: &Item, tag: Tag) -> Option<Tag> {
    match obj.element(tag).ok()?.value() {
        Value::Primitive(PrimitiveValue::Tags(tags)) => tags.first().copied(),
        _ => None,
    }
}

pub(crate) fn put_str(obj: &mut Item, tag: Tag, vr: VR, value: impl Into<String>) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value.into())));
}

pub(crate) fn put_strs(obj: &mut Item, tag: Tag, vr: VR, values: &[String]) {
    let strs: SmallVec<[String; 2]> = values.iter().cloned().collect();
    obj.put(DataElement::new(tag, vr, PrimitiveValue::Strs(strs)));
}

pub(crate) fn put_u16(obj: &mut Item, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
}

pub(crate) fn put_i32(obj: &mut Item, tag: Tag, vr: VR, value: i32) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

pub(crate) fn put_u32s(obj: &mut Item, tag: Tag, values: &[u32]) {
    let vals: SmallVec<[u32; 2]> = values.iter().copied().collect();
    obj.put(DataElement::new(tag, VR::UL, PrimitiveValue::U32(vals)));
}

/// Write an integer-string (VR IS) attribute.
pub(crate) fn put_int_str(obj: &mut Item, tag: Tag, value: i64) {
    put_str(obj, tag, VR::IS, value.to_string());
}

/// Write a decimal-string (VR DS) attribute with one or more values.
pub(crate) fn put_ds(obj: &mut Item, tag: Tag, values: &[f64]) {
    let strs: Vec<String> = values.iter().map(|v| format_ds(*v)).collect();
    put_strs(obj, tag, VR::DS, &strs);
}

pub(crate) fn put_seq(obj: &mut Item, tag: Tag, items: Vec<Item>) {
    obj.put(DataElement::new(
        tag,
        VR::SQ,
        Value::Sequence(DataSetSequence::from(items)),
    ));
}

pub(crate) fn put_tag(obj: &mut Item, tag: Tag, value: Tag) {
    let tags: SmallVec<[Tag; 2]> = [value].into_iter().collect();
    obj.put(DataElement::new(tag, VR::AT, PrimitiveValue::Tags(tags)));
}

/// Format a number as a DICOM decimal string.
///
/// Uses the shortest round-trip representation, reducing precision only
/// when the 16-byte DS limit forces it.
pub(crate) fn format_ds(value: f64) -> String {
    let s = format!("{value}");
    if s.len() <= 16 {
        return s;
    }
    for precision in (0..=14).rev() {
        let s = format!("{value:.precision$}");
        if s.len() <= 16 {
            return s;
        }
    }
    // Values this wide do not occur in plane geometry; fall back to
    // scientific notation truncated to the limit.
    let mut s = format!("{value:e}");
    s.truncate(16);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn format_ds_round_trip() {
        assert_eq!(format_ds(1.0), "1");
        assert_eq!(format_ds(-2.5), "-2.5");
        assert_eq!(format_ds(0.125), "0.125");
        assert!(format_ds(0.1 + 0.2).len() <= 16);
    }

    #[test]
    fn string_round_trip() {
        let mut item = Item::new_empty();
        put_str(&mut item, tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4");
        assert_eq!(
            string(&item, tags::SOP_INSTANCE_UID).as_deref(),
            Some("1.2.3.4")
        );
        assert_eq!(string(&item, tags::SOP_CLASS_UID), None);
    }

    #[test]
    fn int_list_round_trip() {
        let mut item = Item::new_empty();
        put_u32s(&mut item, tags::DIMENSION_INDEX_VALUES, &[1, 4, 2]);
        assert_eq!(
            u32_list(&item, tags::DIMENSION_INDEX_VALUES),
            Some(vec![1, 4, 2])
        );
    }

    #[test]
    fn tag_round_trip() {
        let mut item = Item::new_empty();
        put_tag(
            &mut item,
            tags::DIMENSION_INDEX_POINTER,
            tags::IMAGE_POSITION_PATIENT,
        );
        assert_eq!(
            tag_value(&item, tags::DIMENSION_INDEX_POINTER),
            Some(tags::IMAGE_POSITION_PATIENT)
        );
    }
}
