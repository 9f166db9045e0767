//! Typed views over the source image datasets a segmentation derives
//! from. Attribute access happens here, once, so the encode pipeline
//! works with plain records.

use dicom::core::VR;
use dicom_dictionary_std::tags;

use crate::attrs::{self, Item};
use crate::content::{PixelMeasures, PlaneOrientation, PlanePosition};
use crate::enums::CoordinateSystem;
use crate::error::{Result, SegmentationError};

/// The attributes of a source image that drive encoding.
#[derive(Debug, Clone)]
pub(crate) struct SourceImage {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub rows: u32,
    pub columns: u32,
    pub frame_of_reference_uid: Option<String>,
    pub position_reference_indicator: Option<String>,
    pub number_of_frames: Option<u32>,
    pub is_tiled: bool,
    pub has_slide_geometry: bool,
    pub modality: Option<String>,
}

impl SourceImage {
    pub(crate) fn is_multiframe(&self) -> bool {
        self.number_of_frames.is_some()
    }

    /// The attributes all source images must agree on.
    pub(crate) fn homogeneity_key(&self) -> (String, String, u32, u32, Option<String>) {
        (
            self.study_instance_uid.clone(),
            self.series_instance_uid.clone(),
            self.rows,
            self.columns,
            self.frame_of_reference_uid.clone(),
        )
    }
}

fn require(obj: &Item, tag: dicom::core::Tag, keyword: &str) -> Result<String> {
    attrs::string(obj, tag).ok_or_else(|| {
        SegmentationError::Configuration(format!("source image lacks attribute {keyword}"))
    })
}

pub(crate) fn extract(obj: &Item) -> Result<SourceImage> {
    let rows = attrs::u32_value(obj, tags::ROWS).ok_or_else(|| {
        SegmentationError::Configuration("source image lacks attribute Rows".into())
    })?;
    let columns = attrs::u32_value(obj, tags::COLUMNS).ok_or_else(|| {
        SegmentationError::Configuration("source image lacks attribute Columns".into())
    })?;
    Ok(SourceImage {
        study_instance_uid: require(obj, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
        series_instance_uid: require(obj, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
        sop_instance_uid: require(obj, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
        sop_class_uid: require(obj, tags::SOP_CLASS_UID, "SOPClassUID")?,
        rows,
        columns,
        frame_of_reference_uid: attrs::string(obj, tags::FRAME_OF_REFERENCE_UID),
        position_reference_indicator: attrs::string(obj, tags::POSITION_REFERENCE_INDICATOR),
        number_of_frames: attrs::u32_value(obj, tags::NUMBER_OF_FRAMES),
        is_tiled: attrs::u32_value(obj, tags::TOTAL_PIXEL_MATRIX_ROWS).is_some(),
        has_slide_geometry: attrs::f64_list(obj, tags::IMAGE_ORIENTATION_SLIDE).is_some()
            || attrs::items(obj, tags::IMAGE_CENTER_POINT_COORDINATES_SEQUENCE).is_some(),
        modality: attrs::string(obj, tags::MODALITY),
    })
}

/// One plane position per single-frame source image, in input order.
pub(crate) fn plane_positions_of_series(objs: &[Item]) -> Result<Vec<PlanePosition>> {
    objs.iter()
        .map(|obj| {
            let pos = attrs::f64_list(obj, tags::IMAGE_POSITION_PATIENT)
                .filter(|v| v.len() == 3)
                .ok_or_else(|| {
                    SegmentationError::Configuration(
                        "source image lacks a 3-valued ImagePositionPatient".into(),
                    )
                })?;
            Ok(PlanePosition::Patient([pos[0], pos[1], pos[2]]))
        })
        .collect()
}

/// One plane position per frame of a multi-frame source image.
pub(crate) fn plane_positions_of_multiframe(
    obj: &Item,
    coordinate_system: CoordinateSystem,
) -> Result<Vec<PlanePosition>> {
    let frames = attrs::items(obj, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE).ok_or_else(
        || {
            SegmentationError::Configuration(
                "multi-frame source image lacks PerFrameFunctionalGroupsSequence".into(),
            )
        },
    )?;
    frames
        .iter()
        .map(|frame_item| {
            let group_tag = match coordinate_system {
                CoordinateSystem::Patient => tags::PLANE_POSITION_SEQUENCE,
                CoordinateSystem::Slide => tags::PLANE_POSITION_SLIDE_SEQUENCE,
            };
            let item = attrs::items(frame_item, group_tag)
                .and_then(|items| items.first())
                .ok_or_else(|| {
                    SegmentationError::Configuration(
                        "multi-frame source image lacks per-frame plane positions".into(),
                    )
                })?;
            PlanePosition::from_item(item, coordinate_system).map_err(|_| {
                SegmentationError::Configuration(
                    "multi-frame source image carries incomplete plane positions".into(),
                )
            })
        })
        .collect()
}

/// Orientation shared by all planes of the source.
pub(crate) fn plane_orientation(
    obj: &Item,
    coordinate_system: CoordinateSystem,
    is_multiframe: bool,
) -> Result<PlaneOrientation> {
    let missing = || {
        SegmentationError::Configuration("source image lacks a plane orientation".into())
    };
    match coordinate_system {
        CoordinateSystem::Slide => {
            let v = attrs::f64_list(obj, tags::IMAGE_ORIENTATION_SLIDE)
                .filter(|v| v.len() == 6)
                .ok_or_else(missing)?;
            Ok(PlaneOrientation::Slide([v[0], v[1], v[2], v[3], v[4], v[5]]))
        }
        CoordinateSystem::Patient => {
            if is_multiframe {
                let shared = attrs::items(obj, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE)
                    .and_then(|items| items.first())
                    .ok_or_else(missing)?;
                let item = attrs::items(shared, tags::PLANE_ORIENTATION_SEQUENCE)
                    .and_then(|items| items.first())
                    .ok_or_else(missing)?;
                PlaneOrientation::from_item(item).map_err(|_| missing())
            } else {
                let v = attrs::f64_list(obj, tags::IMAGE_ORIENTATION_PATIENT)
                    .filter(|v| v.len() == 6)
                    .ok_or_else(missing)?;
                Ok(PlaneOrientation::Patient([
                    v[0], v[1], v[2], v[3], v[4], v[5],
                ]))
            }
        }
    }
}

fn measures_from_item(item: &Item) -> Option<PixelMeasures> {
    let spacing = attrs::f64_list(item, tags::PIXEL_SPACING).filter(|v| v.len() == 2)?;
    Some(PixelMeasures {
        pixel_spacing: [spacing[0], spacing[1]],
        slice_thickness: attrs::f64_list(item, tags::SLICE_THICKNESS)
            .and_then(|v| v.first().copied()),
        spacing_between_slices: attrs::f64_list(item, tags::SPACING_BETWEEN_SLICES)
            .and_then(|v| v.first().copied()),
    })
}

/// Pixel measures inherited from the source when the caller supplies
/// none. Absent spacing information yields `None` rather than failing.
pub(crate) fn pixel_measures(obj: &Item, is_multiframe: bool) -> Option<PixelMeasures> {
    if is_multiframe {
        let shared = attrs::items(obj, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE)?.first()?;
        let item = attrs::items(shared, tags::PIXEL_MEASURES_SEQUENCE)?.first()?;
        measures_from_item(item)
    } else {
        measures_from_item(obj)
    }
}

/// Copy patient and study identification from the source dataset.
pub(crate) fn copy_patient_and_study(dest: &mut Item, src: &Item) {
    let copied: [(dicom::core::Tag, VR); 9] = [
        (tags::PATIENT_NAME, VR::PN),
        (tags::PATIENT_ID, VR::LO),
        (tags::PATIENT_BIRTH_DATE, VR::DA),
        (tags::PATIENT_SEX, VR::CS),
        (tags::ACCESSION_NUMBER, VR::SH),
        (tags::STUDY_ID, VR::SH),
        (tags::STUDY_DATE, VR::DA),
        (tags::STUDY_TIME, VR::TM),
        (tags::REFERRING_PHYSICIAN_NAME, VR::PN),
    ];
    for (tag, vr) in copied {
        if let Some(value) = attrs::string(src, tag) {
            attrs::put_str(dest, tag, vr, value);
        }
    }
}

/// Propagate the lossy-compression state of the source.
pub(crate) fn copy_lossy_compression(dest: &mut Item, src: &Item) {
    let flag = attrs::string(src, tags::LOSSY_IMAGE_COMPRESSION).unwrap_or_else(|| "00".into());
    attrs::put_str(dest, tags::LOSSY_IMAGE_COMPRESSION, VR::CS, &*flag);
    if flag == "01" {
        if let Some(ratio) = attrs::string(src, tags::LOSSY_IMAGE_COMPRESSION_RATIO) {
            attrs::put_str(dest, tags::LOSSY_IMAGE_COMPRESSION_RATIO, VR::DS, ratio);
        }
        if let Some(method) = attrs::string(src, tags::LOSSY_IMAGE_COMPRESSION_METHOD) {
            attrs::put_str(dest, tags::LOSSY_IMAGE_COMPRESSION_METHOD, VR::CS, method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_source() -> Item {
        let mut obj = Item::new_empty();
        attrs::put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");
        attrs::put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.1");
        attrs::put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.1.1");
        attrs::put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.2");
        attrs::put_u16(&mut obj, tags::ROWS, 4);
        attrs::put_u16(&mut obj, tags::COLUMNS, 4);
        obj
    }

    #[test]
    fn extracts_required_attributes() {
        let src = extract(&minimal_source()).unwrap();
        assert_eq!(src.rows, 4);
        assert!(!src.is_multiframe());
        assert!(!src.is_tiled);
        assert!(src.frame_of_reference_uid.is_none());
    }

    #[test]
    fn missing_required_attribute_fails() {
        let mut obj = minimal_source();
        obj.remove_element(tags::SOP_INSTANCE_UID);
        assert!(matches!(
            extract(&obj),
            Err(SegmentationError::Configuration(_))
        ));
    }

    #[test]
    fn series_positions_in_input_order() {
        let mut a = minimal_source();
        attrs::put_ds(&mut a, tags::IMAGE_POSITION_PATIENT, &[0.0, 0.0, 10.0]);
        let mut b = minimal_source();
        attrs::put_ds(&mut b, tags::IMAGE_POSITION_PATIENT, &[0.0, 0.0, 5.0]);
        let positions = plane_positions_of_series(&[a, b]).unwrap();
        assert_eq!(
            positions,
            vec![
                PlanePosition::Patient([0.0, 0.0, 10.0]),
                PlanePosition::Patient([0.0, 0.0, 5.0]),
            ]
        );
    }

    #[test]
    fn lossy_compression_default() {
        let src = minimal_source();
        let mut dest = Item::new_empty();
        copy_lossy_compression(&mut dest, &src);
        assert_eq!(
            attrs::string(&dest, tags::LOSSY_IMAGE_COMPRESSION).as_deref(),
            Some("00")
        );
    }
}
