//! Typed records for the sequence items a segmentation object carries:
//! segment descriptions, plane positions and orientations, pixel
//! measures, and the dimension-index layout.
//!
//! Each record owns its semantic content and converts to and from the
//! generic item representation exactly once, at the object boundary.

use dicom::core::{Tag, VR};
use dicom_dictionary_std::tags;
use ordered_float::OrderedFloat;

use crate::attrs::{self, Item};
use crate::coding::CodedConcept;
use crate::enums::{CoordinateSystem, SegmentAlgorithmType};
use crate::error::{Result, SegmentationError};

/// Description of a single segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescription {
    segment_number: u32,
    segment_label: String,
    segmented_property_category: CodedConcept,
    segmented_property_type: CodedConcept,
    algorithm_type: SegmentAlgorithmType,
    algorithm_name: Option<String>,
    tracking_id: Option<String>,
    tracking_uid: Option<String>,
}

impl SegmentDescription {
    pub fn new(
        segment_number: u32,
        segment_label: impl Into<String>,
        segmented_property_category: CodedConcept,
        segmented_property_type: CodedConcept,
        algorithm_type: SegmentAlgorithmType,
    ) -> Result<Self> {
        if segment_number < 1 {
            return Err(SegmentationError::Configuration(
                "segment numbers must be positive".into(),
            ));
        }
        Ok(Self {
            segment_number,
            segment_label: segment_label.into(),
            segmented_property_category,
            segmented_property_type,
            algorithm_type,
            algorithm_name: None,
            tracking_id: None,
            tracking_uid: None,
        })
    }

    pub fn with_algorithm_name(mut self, name: impl Into<String>) -> Self {
        self.algorithm_name = Some(name.into());
        self
    }

    pub fn with_tracking(mut self, id: impl Into<String>, uid: impl Into<String>) -> Self {
        self.tracking_id = Some(id.into());
        self.tracking_uid = Some(uid.into());
        self
    }

    pub fn segment_number(&self) -> u32 {
        self.segment_number
    }

    pub fn segment_label(&self) -> &str {
        &self.segment_label
    }

    pub fn segmented_property_category(&self) -> &CodedConcept {
        &self.segmented_property_category
    }

    pub fn segmented_property_type(&self) -> &CodedConcept {
        &self.segmented_property_type
    }

    pub fn algorithm_type(&self) -> SegmentAlgorithmType {
        self.algorithm_type
    }

    pub fn algorithm_name(&self) -> Option<&str> {
        self.algorithm_name.as_deref()
    }

    pub fn tracking_id(&self) -> Option<&str> {
        self.tracking_id.as_deref()
    }

    pub fn tracking_uid(&self) -> Option<&str> {
        self.tracking_uid.as_deref()
    }

    pub(crate) fn to_item(&self) -> Item {
        let mut item = Item::new_empty();
        attrs::put_u16(&mut item, tags::SEGMENT_NUMBER, self.segment_number as u16);
        attrs::put_str(
            &mut item,
            tags::SEGMENT_LABEL,
            VR::LO,
            &*self.segment_label,
        );
        attrs::put_seq(
            &mut item,
            tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE,
            vec![self.segmented_property_category.to_item()],
        );
        attrs::put_seq(
            &mut item,
            tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE,
            vec![self.segmented_property_type.to_item()],
        );
        attrs::put_str(
            &mut item,
            tags::SEGMENT_ALGORITHM_TYPE,
            VR::CS,
            self.algorithm_type.as_str(),
        );
        if let Some(name) = &self.algorithm_name {
            attrs::put_str(&mut item, tags::SEGMENT_ALGORITHM_NAME, VR::LO, &**name);
        }
        if let Some(id) = &self.tracking_id {
            attrs::put_str(&mut item, tags::TRACKING_ID, VR::LO, &**id);
        }
        if let Some(uid) = &self.tracking_uid {
            attrs::put_str(&mut item, tags::TRACKING_UID, VR::UI, &**uid);
        }
        item
    }

    pub(crate) fn from_item(item: &Item) -> Result<Self> {
        let segment_number = attrs::u32_value(item, tags::SEGMENT_NUMBER).ok_or_else(|| {
            SegmentationError::Integrity("segment description lacks SegmentNumber".into())
        })?;
        let segment_label = attrs::string(item, tags::SEGMENT_LABEL).unwrap_or_default();
        let category = attrs::items(item, tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE)
            .and_then(|items| items.first())
            .map(CodedConcept::from_item)
            .transpose()?
            .ok_or_else(|| {
                SegmentationError::Integrity(
                    "segment description lacks SegmentedPropertyCategoryCodeSequence".into(),
                )
            })?;
        let prop_type = attrs::items(item, tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE)
            .and_then(|items| items.first())
            .map(CodedConcept::from_item)
            .transpose()?
            .ok_or_else(|| {
                SegmentationError::Integrity(
                    "segment description lacks SegmentedPropertyTypeCodeSequence".into(),
                )
            })?;
        let algorithm_type = attrs::string(item, tags::SEGMENT_ALGORITHM_TYPE)
            .map(|s| SegmentAlgorithmType::parse(&s))
            .transpose()?
            .ok_or_else(|| {
                SegmentationError::Integrity(
                    "segment description lacks SegmentAlgorithmType".into(),
                )
            })?;
        Ok(Self {
            segment_number,
            segment_label,
            segmented_property_category: category,
            segmented_property_type: prop_type,
            algorithm_type,
            algorithm_name: attrs::string(item, tags::SEGMENT_ALGORITHM_NAME),
            tracking_id: attrs::string(item, tags::TRACKING_ID),
            tracking_uid: attrs::string(item, tags::TRACKING_UID),
        })
    }
}

/// Position of one image plane in the three-dimensional coordinate
/// system. Compared exactly, never approximately.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanePosition {
    /// Offset of the top-left pixel center in the frame of reference.
    Patient([f64; 3]),
    /// Tile offsets in the total pixel matrix and in slide coordinates.
    Slide {
        column_position: i32,
        row_position: i32,
        x: f64,
        y: f64,
        z: f64,
    },
}

/// One orderable component of a plane position, used for ranking planes
/// along an indexed dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PositionValue {
    Int(i32),
    Scalar(OrderedFloat<f64>),
    Triplet([OrderedFloat<f64>; 3]),
}

impl PlanePosition {
    pub(crate) fn coordinate_system(&self) -> CoordinateSystem {
        match self {
            PlanePosition::Patient(_) => CoordinateSystem::Patient,
            PlanePosition::Slide { .. } => CoordinateSystem::Slide,
        }
    }

    /// Decompose into one value per indexed dimension, in dimension
    /// pointer order. Patient positions index as a single coordinate
    /// triplet; slide positions index per attribute.
    pub(crate) fn index_values(&self) -> Vec<PositionValue> {
        match self {
            PlanePosition::Patient([x, y, z]) => vec![PositionValue::Triplet([
                OrderedFloat(*x),
                OrderedFloat(*y),
                OrderedFloat(*z),
            ])],
            PlanePosition::Slide {
                column_position,
                row_position,
                x,
                y,
                z,
            } => vec![
                PositionValue::Int(*column_position),
                PositionValue::Int(*row_position),
                PositionValue::Scalar(OrderedFloat(*x)),
                PositionValue::Scalar(OrderedFloat(*y)),
                PositionValue::Scalar(OrderedFloat(*z)),
            ],
        }
    }

    pub(crate) fn to_item(&self) -> Item {
        let mut item = Item::new_empty();
        match self {
            PlanePosition::Patient(pos) => {
                attrs::put_ds(&mut item, tags::IMAGE_POSITION_PATIENT, pos);
            }
            PlanePosition::Slide {
                column_position,
                row_position,
                x,
                y,
                z,
            } => {
                attrs::put_i32(
                    &mut item,
                    tags::COLUMN_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX,
                    VR::SL,
                    *column_position,
                );
                attrs::put_i32(
                    &mut item,
                    tags::ROW_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX,
                    VR::SL,
                    *row_position,
                );
                attrs::put_ds(&mut item, tags::X_OFFSET_IN_SLIDE_COORDINATE_SYSTEM, &[*x]);
                attrs::put_ds(&mut item, tags::Y_OFFSET_IN_SLIDE_COORDINATE_SYSTEM, &[*y]);
                attrs::put_ds(&mut item, tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM, &[*z]);
            }
        }
        item
    }

    /// The per-frame functional group this position lives in.
    pub(crate) fn functional_group_tag(&self) -> Tag {
        match self {
            PlanePosition::Patient(_) => tags::PLANE_POSITION_SEQUENCE,
            PlanePosition::Slide { .. } => tags::PLANE_POSITION_SLIDE_SEQUENCE,
        }
    }

    pub(crate) fn from_item(item: &Item, coordinate_system: CoordinateSystem) -> Result<Self> {
        match coordinate_system {
            CoordinateSystem::Patient => {
                let pos = attrs::f64_list(item, tags::IMAGE_POSITION_PATIENT)
                    .filter(|v| v.len() == 3)
                    .ok_or_else(|| {
                        SegmentationError::Integrity(
                            "plane position item lacks a 3-valued ImagePositionPatient".into(),
                        )
                    })?;
                Ok(PlanePosition::Patient([pos[0], pos[1], pos[2]]))
            }
            CoordinateSystem::Slide => {
                let column_position =
                    attrs::i32_value(item, tags::COLUMN_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX);
                let row_position =
                    attrs::i32_value(item, tags::ROW_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX);
                let x = attrs::f64_list(item, tags::X_OFFSET_IN_SLIDE_COORDINATE_SYSTEM);
                let y = attrs::f64_list(item, tags::Y_OFFSET_IN_SLIDE_COORDINATE_SYSTEM);
                let z = attrs::f64_list(item, tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM);
                match (column_position, row_position, x, y, z) {
                    (Some(c), Some(r), Some(x), Some(y), Some(z))
                        if !x.is_empty() && !y.is_empty() && !z.is_empty() =>
                    {
                        Ok(PlanePosition::Slide {
                            column_position: c,
                            row_position: r,
                            x: x[0],
                            y: y[0],
                            z: z[0],
                        })
                    }
                    _ => Err(SegmentationError::Integrity(
                        "plane position item lacks slide position attributes".into(),
                    )),
                }
            }
        }
    }
}

/// Orientation of all image planes relative to the coordinate system.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaneOrientation {
    Patient([f64; 6]),
    Slide([f64; 6]),
}

impl PlaneOrientation {
    pub(crate) fn direction_cosines(&self) -> &[f64; 6] {
        match self {
            PlaneOrientation::Patient(v) | PlaneOrientation::Slide(v) => v,
        }
    }

    pub(crate) fn to_item(&self) -> Item {
        let mut item = Item::new_empty();
        match self {
            PlaneOrientation::Patient(v) => {
                attrs::put_ds(&mut item, tags::IMAGE_ORIENTATION_PATIENT, v);
            }
            PlaneOrientation::Slide(v) => {
                attrs::put_ds(&mut item, tags::IMAGE_ORIENTATION_SLIDE, v);
            }
        }
        item
    }

    pub(crate) fn from_item(item: &Item) -> Result<Self> {
        if let Some(v) = attrs::f64_list(item, tags::IMAGE_ORIENTATION_SLIDE) {
            if v.len() == 6 {
                return Ok(PlaneOrientation::Slide([
                    v[0], v[1], v[2], v[3], v[4], v[5],
                ]));
            }
        }
        if let Some(v) = attrs::f64_list(item, tags::IMAGE_ORIENTATION_PATIENT) {
            if v.len() == 6 {
                return Ok(PlaneOrientation::Patient([
                    v[0], v[1], v[2], v[3], v[4], v[5],
                ]));
            }
        }
        Err(SegmentationError::Integrity(
            "plane orientation item lacks direction cosines".into(),
        ))
    }
}

/// Physical spacing of the segmentation pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMeasures {
    pub pixel_spacing: [f64; 2],
    pub slice_thickness: Option<f64>,
    pub spacing_between_slices: Option<f64>,
}

impl PixelMeasures {
    pub(crate) fn to_item(&self) -> Item {
        let mut item = Item::new_empty();
        attrs::put_ds(&mut item, tags::PIXEL_SPACING, &self.pixel_spacing);
        if let Some(thickness) = self.slice_thickness {
            attrs::put_ds(&mut item, tags::SLICE_THICKNESS, &[thickness]);
        }
        if let Some(spacing) = self.spacing_between_slices {
            attrs::put_ds(&mut item, tags::SPACING_BETWEEN_SLICES, &[spacing]);
        }
        item
    }
}

/// Ordered (dimension index pointer, functional group pointer) pairs for
/// the given coordinate system, excluding the segment-number pointer.
pub(crate) fn dimension_pointers(
    coordinate_system: Option<CoordinateSystem>,
) -> Vec<(Tag, Tag)> {
    match coordinate_system {
        Some(CoordinateSystem::Patient) => vec![(
            tags::IMAGE_POSITION_PATIENT,
            tags::PLANE_POSITION_SEQUENCE,
        )],
        Some(CoordinateSystem::Slide) => vec![
            (
                tags::COLUMN_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX,
                tags::PLANE_POSITION_SLIDE_SEQUENCE,
            ),
            (
                tags::ROW_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX,
                tags::PLANE_POSITION_SLIDE_SEQUENCE,
            ),
            (
                tags::X_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
                tags::PLANE_POSITION_SLIDE_SEQUENCE,
            ),
            (
                tags::Y_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
                tags::PLANE_POSITION_SLIDE_SEQUENCE,
            ),
            (
                tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
                tags::PLANE_POSITION_SLIDE_SEQUENCE,
            ),
        ],
        None => Vec::new(),
    }
}

fn dimension_label(pointer: Tag) -> &'static str {
    match pointer {
        t if t == tags::REFERENCED_SEGMENT_NUMBER => "Segment Number",
        t if t == tags::IMAGE_POSITION_PATIENT => "Image Position Patient",
        t if t == tags::COLUMN_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX => "Column Position",
        t if t == tags::ROW_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX => "Row Position",
        t if t == tags::X_OFFSET_IN_SLIDE_COORDINATE_SYSTEM => "X Offset",
        t if t == tags::Y_OFFSET_IN_SLIDE_COORDINATE_SYSTEM => "Y Offset",
        t if t == tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM => "Z Offset",
        _ => "Dimension Index",
    }
}

/// Items of the DimensionIndexSequence, in dimension order.
pub(crate) fn dimension_index_items(
    coordinate_system: Option<CoordinateSystem>,
    include_segment_number: bool,
    organization_uid: &str,
) -> Vec<Item> {
    let mut pointer_pairs = Vec::new();
    if include_segment_number {
        pointer_pairs.push((
            tags::REFERENCED_SEGMENT_NUMBER,
            tags::SEGMENT_IDENTIFICATION_SEQUENCE,
        ));
    }
    pointer_pairs.extend(dimension_pointers(coordinate_system));

    pointer_pairs
        .into_iter()
        .map(|(pointer, group)| {
            let mut item = Item::new_empty();
            attrs::put_str(
                &mut item,
                tags::DIMENSION_ORGANIZATION_UID,
                VR::UI,
                organization_uid,
            );
            attrs::put_tag(&mut item, tags::DIMENSION_INDEX_POINTER, pointer);
            attrs::put_tag(&mut item, tags::FUNCTIONAL_GROUP_POINTER, group);
            attrs::put_str(
                &mut item,
                tags::DIMENSION_DESCRIPTION_LABEL,
                VR::LO,
                dimension_label(pointer),
            );
            item
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tissue() -> CodedConcept {
        CodedConcept::new("85756007", "SCT", "Tissue")
    }

    #[test]
    fn segment_description_round_trip() {
        let desc = SegmentDescription::new(
            2,
            "tumor",
            tissue(),
            CodedConcept::new("49755003", "SCT", "Tumor"),
            SegmentAlgorithmType::Manual,
        )
        .unwrap()
        .with_tracking("Lesion #1", "1.2.826.0.1.3680043.8.498.1");
        let parsed = SegmentDescription::from_item(&desc.to_item()).unwrap();
        assert_eq!(desc, parsed);
    }

    #[test]
    fn zero_segment_number_rejected() {
        let result = SegmentDescription::new(
            0,
            "bg",
            tissue(),
            tissue(),
            SegmentAlgorithmType::Automatic,
        );
        assert!(matches!(
            result,
            Err(SegmentationError::Configuration(_))
        ));
    }

    #[test]
    fn patient_position_round_trip() {
        let pos = PlanePosition::Patient([-12.5, 3.0, 40.25]);
        let parsed =
            PlanePosition::from_item(&pos.to_item(), CoordinateSystem::Patient).unwrap();
        assert_eq!(pos, parsed);
    }

    #[test]
    fn slide_position_round_trip() {
        let pos = PlanePosition::Slide {
            column_position: 11,
            row_position: 1,
            x: 0.5,
            y: 1.5,
            z: 0.0,
        };
        let parsed = PlanePosition::from_item(&pos.to_item(), CoordinateSystem::Slide).unwrap();
        assert_eq!(pos, parsed);
    }

    #[test]
    fn patient_positions_order_as_tuples() {
        let a = PlanePosition::Patient([0.0, 0.0, 1.0]).index_values();
        let b = PlanePosition::Patient([0.0, 0.0, 2.0]).index_values();
        let c = PlanePosition::Patient([0.0, 1.0, 0.0]).index_values();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn dimension_layout_per_coordinate_system() {
        assert_eq!(dimension_pointers(Some(CoordinateSystem::Patient)).len(), 1);
        assert_eq!(dimension_pointers(Some(CoordinateSystem::Slide)).len(), 5);
        assert!(dimension_pointers(None).is_empty());
        let items = dimension_index_items(Some(CoordinateSystem::Patient), true, "1.2.3");
        assert_eq!(items.len(), 2);
    }
}
