//! The segmentation object: encode constructor, decode constructor and
//! frame-level query methods.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;
use std::path::Path;

use dicom::core::value::{PixelFragmentSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use itertools::{Itertools, MinMaxResult};
use ndarray::{Array2, Array3, ArrayD, Axis};

use crate::attrs::{self, Item};
use crate::coding;
use crate::content::{
    PixelMeasures, PlaneOrientation, PlanePosition, PositionValue, SegmentDescription,
    dimension_index_items,
};
use crate::enums::{
    CoordinateSystem, FractionalType, SegmentAlgorithmType, SegmentationType, SegmentsOverlap,
    SpatialLocationsPreserved,
};
use crate::error::{Result, SegmentationError};
use crate::frame::{
    self, CodecRegistry, EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, FrameContext,
    JPEG_2000_LOSSLESS, JPEG_LS_LOSSLESS, RLE_LOSSLESS, StoredFrames,
};
use crate::index::{FrameIndex, FrameRow, SegmentNumbering, SourceRef, segment_output_map};
use crate::pixels::{
    CanonicalPixels, PixelArray, combine_stack_to_labels, normalize_pixel_array,
    smallest_unsigned_bits,
};
use crate::reconstruct::{MaskPixel, combined_mask, stacked_mask, validate_output_type};
use crate::source::{self, SourceImage};
use crate::spatial::image_to_reference;

pub(crate) const SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.4";

/// Options controlling how a mask array is reconstructed.
#[derive(Debug, Clone)]
pub struct MaskOptions {
    segment_numbers: Option<Vec<u32>>,
    combine_segments: bool,
    relabel: bool,
    ignore_spatial_locations: bool,
    assert_missing_frames_are_empty: bool,
    rescale_fractional: bool,
    skip_overlap_checks: bool,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            segment_numbers: None,
            combine_segments: false,
            relabel: false,
            ignore_spatial_locations: false,
            assert_missing_frames_are_empty: false,
            rescale_fractional: true,
            skip_overlap_checks: false,
        }
    }
}

impl MaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the output to the given segments, in the given order.
    /// All segments are included when unset.
    pub fn with_segment_numbers(mut self, segment_numbers: Vec<u32>) -> Self {
        self.segment_numbers = Some(segment_numbers);
        self
    }

    /// Combine segments into a single label map per output frame
    /// instead of stacking binary masks along the last axis.
    pub fn with_combine_segments(mut self, combine: bool) -> Self {
        self.combine_segments = combine;
        self
    }

    /// With `combine_segments`, renumber the output values to 1..=N in
    /// requested segment order.
    pub fn with_relabel(mut self, relabel: bool) -> Self {
        self.relabel = relabel;
        self
    }

    /// Index by source frames even when the object does not assert
    /// that spatial locations are preserved.
    pub fn with_ignore_spatial_locations(mut self, ignore: bool) -> Self {
        self.ignore_spatial_locations = ignore;
        self
    }

    /// Return all-zero frames for requested keys the object does not
    /// reference instead of failing the lookup.
    pub fn with_assert_missing_frames_are_empty(mut self, assert_empty: bool) -> Self {
        self.assert_missing_frames_are_empty = assert_empty;
        self
    }

    /// For fractional objects, divide stored values by the declared
    /// maximum so the output lies in `[0.0, 1.0]`. On by default.
    pub fn with_rescale_fractional(mut self, rescale: bool) -> Self {
        self.rescale_fractional = rescale;
        self
    }

    /// Skip the per-pixel overlap check when combining segments; the
    /// higher output segment number wins on overlapping pixels.
    pub fn with_skip_overlap_checks(mut self, skip: bool) -> Self {
        self.skip_overlap_checks = skip;
        self
    }
}

/// Filters for looking up segments by their descriptive metadata.
#[derive(Debug, Clone, Default)]
pub struct SegmentCriteria {
    segment_label: Option<String>,
    segmented_property_category: Option<crate::coding::CodedConcept>,
    segmented_property_type: Option<crate::coding::CodedConcept>,
    algorithm_type: Option<SegmentAlgorithmType>,
    tracking_id: Option<String>,
    tracking_uid: Option<String>,
}

impl SegmentCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment_label(mut self, label: impl Into<String>) -> Self {
        self.segment_label = Some(label.into());
        self
    }

    pub fn with_segmented_property_category(
        mut self,
        category: crate::coding::CodedConcept,
    ) -> Self {
        self.segmented_property_category = Some(category);
        self
    }

    pub fn with_segmented_property_type(mut self, prop: crate::coding::CodedConcept) -> Self {
        self.segmented_property_type = Some(prop);
        self
    }

    pub fn with_algorithm_type(mut self, algorithm_type: SegmentAlgorithmType) -> Self {
        self.algorithm_type = Some(algorithm_type);
        self
    }

    pub fn with_tracking_id(mut self, id: impl Into<String>) -> Self {
        self.tracking_id = Some(id.into());
        self
    }

    pub fn with_tracking_uid(mut self, uid: impl Into<String>) -> Self {
        self.tracking_uid = Some(uid.into());
        self
    }

    fn matches(&self, description: &SegmentDescription) -> bool {
        if let Some(label) = &self.segment_label {
            if description.segment_label() != label {
                return false;
            }
        }
        if let Some(category) = &self.segmented_property_category {
            if description.segmented_property_category() != category {
                return false;
            }
        }
        if let Some(prop) = &self.segmented_property_type {
            if description.segmented_property_type() != prop {
                return false;
            }
        }
        if let Some(algorithm_type) = self.algorithm_type {
            if description.algorithm_type() != algorithm_type {
                return false;
            }
        }
        if let Some(id) = &self.tracking_id {
            if description.tracking_id() != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(uid) = &self.tracking_uid {
            if description.tracking_uid() != Some(uid.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Builder for encoding a new segmentation object.
#[derive(Debug)]
pub struct SegmentationBuilder {
    series_instance_uid: String,
    series_number: i64,
    sop_instance_uid: String,
    instance_number: i64,
    manufacturer: String,
    manufacturer_model_name: String,
    software_versions: String,
    device_serial_number: String,
    fractional_type: FractionalType,
    max_fractional_value: u16,
    content_label: Option<String>,
    content_description: Option<String>,
    content_creator_name: Option<String>,
    transfer_syntax_uid: String,
    pixel_measures: Option<PixelMeasures>,
    plane_orientation: Option<PlaneOrientation>,
    plane_positions: Option<Vec<PlanePosition>>,
    omit_empty_frames: bool,
    codecs: CodecRegistry,
}

impl SegmentationBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        series_instance_uid: impl Into<String>,
        series_number: i64,
        sop_instance_uid: impl Into<String>,
        instance_number: i64,
        manufacturer: impl Into<String>,
        manufacturer_model_name: impl Into<String>,
        software_versions: impl Into<String>,
        device_serial_number: impl Into<String>,
    ) -> Self {
        Self {
            series_instance_uid: series_instance_uid.into(),
            series_number,
            sop_instance_uid: sop_instance_uid.into(),
            instance_number,
            manufacturer: manufacturer.into(),
            manufacturer_model_name: manufacturer_model_name.into(),
            software_versions: software_versions.into(),
            device_serial_number: device_serial_number.into(),
            fractional_type: FractionalType::Probability,
            max_fractional_value: 255,
            content_label: None,
            content_description: None,
            content_creator_name: None,
            transfer_syntax_uid: EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            pixel_measures: None,
            plane_orientation: None,
            plane_positions: None,
            omit_empty_frames: true,
            codecs: CodecRegistry::default(),
        }
    }

    pub fn fractional_type(mut self, fractional_type: FractionalType) -> Self {
        self.fractional_type = fractional_type;
        self
    }

    pub fn max_fractional_value(mut self, max_fractional_value: u16) -> Self {
        self.max_fractional_value = max_fractional_value;
        self
    }

    pub fn content_label(mut self, label: impl Into<String>) -> Self {
        self.content_label = Some(label.into());
        self
    }

    pub fn content_description(mut self, description: impl Into<String>) -> Self {
        self.content_description = Some(description.into());
        self
    }

    pub fn content_creator_name(mut self, name: impl Into<String>) -> Self {
        self.content_creator_name = Some(name.into());
        self
    }

    pub fn transfer_syntax_uid(mut self, uid: impl Into<String>) -> Self {
        self.transfer_syntax_uid = uid.into();
        self
    }

    pub fn pixel_measures(mut self, measures: PixelMeasures) -> Self {
        self.pixel_measures = Some(measures);
        self
    }

    pub fn plane_orientation(mut self, orientation: PlaneOrientation) -> Self {
        self.plane_orientation = Some(orientation);
        self
    }

    pub fn plane_positions(mut self, positions: Vec<PlanePosition>) -> Self {
        self.plane_positions = Some(positions);
        self
    }

    /// Keep frames with no positive pixel instead of omitting them.
    pub fn omit_empty_frames(mut self, omit: bool) -> Self {
        self.omit_empty_frames = omit;
        self
    }

    /// Codecs available for encapsulated transfer syntaxes.
    pub fn codec_registry(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Encode a segmentation of `source_images` from `pixel_array`.
    pub fn build(
        self,
        source_images: &[InMemDicomObject],
        pixel_array: PixelArray,
        segmentation_type: SegmentationType,
        segment_descriptions: Vec<SegmentDescription>,
    ) -> Result<Segmentation> {
        if source_images.is_empty() {
            return Err(SegmentationError::Configuration(
                "at least one source image is required".into(),
            ));
        }
        let sources: Vec<SourceImage> = source_images
            .iter()
            .map(source::extract)
            .collect::<Result<_>>()?;
        if !sources.iter().map(SourceImage::homogeneity_key).all_equal() {
            return Err(SegmentationError::Configuration(
                "source images must belong to one series and share study, \
                 dimensions and frame of reference"
                    .into(),
            ));
        }
        let src = &sources[0];
        let is_multiframe = src.is_multiframe();
        if is_multiframe && sources.len() > 1 {
            return Err(SegmentationError::Configuration(
                "only one source image may be provided when it is multi-frame".into(),
            ));
        }

        let transfer_syntax_uid = self.transfer_syntax_uid.clone();
        if transfer_syntax_uid == EXPLICIT_VR_BIG_ENDIAN {
            return Err(SegmentationError::Configuration(
                "big-endian transfer syntaxes are not supported".into(),
            ));
        }
        let encapsulated = frame::is_encapsulated(&transfer_syntax_uid);
        if encapsulated {
            let lossless = [RLE_LOSSLESS, JPEG_LS_LOSSLESS, JPEG_2000_LOSSLESS];
            if !lossless.contains(&transfer_syntax_uid.as_str()) {
                return Err(SegmentationError::Configuration(format!(
                    "transfer syntax {transfer_syntax_uid} is not supported"
                )));
            }
            if !self.codecs.supports(&transfer_syntax_uid) {
                return Err(SegmentationError::Configuration(format!(
                    "no frame codec registered for transfer syntax {transfer_syntax_uid}"
                )));
            }
        }

        let numbers: Vec<u32> = segment_descriptions
            .iter()
            .map(SegmentDescription::segment_number)
            .collect();
        check_segment_numbers(&numbers)?;
        let number_of_segments = numbers.len() as u32;

        let bits_allocated: u16 = match segmentation_type {
            SegmentationType::Binary => {
                if encapsulated {
                    return Err(SegmentationError::Configuration(format!(
                        "transfer syntax {transfer_syntax_uid} is not compatible with the \
                         BINARY segmentation type"
                    )));
                }
                1
            }
            SegmentationType::Fractional => {
                if self.max_fractional_value < 1 || self.max_fractional_value > 255 {
                    return Err(SegmentationError::Configuration(
                        "the maximum fractional value must not exceed the 8-bit image depth"
                            .into(),
                    ));
                }
                8
            }
            SegmentationType::LabelMap => {
                let bits = smallest_unsigned_bits(number_of_segments as u64);
                if bits > 16 {
                    return Err(SegmentationError::Configuration(
                        "too many segments for a label-map encoding".into(),
                    ));
                }
                bits
            }
        };

        let (canonical, overlap) =
            normalize_pixel_array(pixel_array, number_of_segments, segmentation_type)?;

        // Coordinate system and geometry defaults.
        let has_frame_of_reference = src.frame_of_reference_uid.is_some();
        let coordinate_system = if has_frame_of_reference {
            if src.has_slide_geometry {
                Some(CoordinateSystem::Slide)
            } else {
                Some(CoordinateSystem::Patient)
            }
        } else {
            if sources.len() > 1 || src.number_of_frames.is_some_and(|n| n > 1) {
                return Err(SegmentationError::Configuration(
                    "only a single source frame is supported when the source image has \
                     no frame of reference"
                        .into(),
                ));
            }
            if self.plane_positions.is_some() || self.plane_orientation.is_some() {
                return Err(SegmentationError::Configuration(
                    "plane geometry may not be specified when the source image has no \
                     frame of reference"
                        .into(),
                ));
            }
            None
        };

        let pixel_measures = self
            .pixel_measures
            .clone()
            .or_else(|| source::pixel_measures(&source_images[0], is_multiframe));

        let (source_plane_positions, source_plane_orientation) = match coordinate_system {
            Some(cs) => {
                let positions = if is_multiframe {
                    source::plane_positions_of_multiframe(&source_images[0], cs)?
                } else if cs == CoordinateSystem::Patient {
                    source::plane_positions_of_series(source_images)?
                } else {
                    return Err(SegmentationError::Configuration(
                        "slide source images must be multi-frame".into(),
                    ));
                };
                let orientation = source::plane_orientation(&source_images[0], cs, is_multiframe)?;
                (positions, Some(orientation))
            }
            None => (Vec::new(), None),
        };

        let plane_orientation = self
            .plane_orientation
            .clone()
            .or_else(|| source_plane_orientation.clone());

        let plane_positions: Vec<PlanePosition> = if coordinate_system.is_some() {
            match self.plane_positions.clone() {
                Some(positions) => {
                    if positions.len() != canonical.num_planes() {
                        return Err(SegmentationError::Configuration(
                            "the number of plane positions does not match the number of \
                             planes in the pixel array"
                                .into(),
                        ));
                    }
                    positions
                }
                None => {
                    if source_plane_positions.len() != canonical.num_planes() {
                        return Err(SegmentationError::Configuration(
                            "the number of source plane positions does not match the \
                             number of planes in the pixel array"
                                .into(),
                        ));
                    }
                    source_plane_positions.clone()
                }
            }
        } else {
            if canonical.num_planes() != 1 {
                return Err(SegmentationError::Configuration(
                    "a source image without a frame of reference supports a single plane"
                        .into(),
                ));
            }
            Vec::new()
        };
        if let Some(cs) = coordinate_system {
            if plane_positions.iter().any(|p| p.coordinate_system() != cs) {
                return Err(SegmentationError::Configuration(
                    "plane positions must match the coordinate system of the source images"
                        .into(),
                ));
            }
        }

        // Exact geometric equality decides whether derivation
        // references may claim preserved spatial locations.
        let locations_preserved = coordinate_system.is_none()
            || (plane_positions == source_plane_positions
                && plane_orientation == source_plane_orientation);

        // Empty-frame omission, with the all-empty fallback.
        let mut omit_empty_frames = self.omit_empty_frames;
        let mut kept: Vec<usize> = (0..canonical.num_planes()).collect();
        if omit_empty_frames {
            let non_empty: Vec<usize> = kept
                .iter()
                .copied()
                .filter(|&p| !canonical.plane_is_empty(p))
                .collect();
            if non_empty.is_empty() {
                log::warn!(
                    "encoding an empty segmentation; keeping all frames since omitting \
                     every frame is not possible"
                );
                omit_empty_frames = false;
            } else {
                kept = non_empty;
            }
        }

        // Canonical plane order and per-dimension value ranking over
        // the kept planes.
        let kept_index_values: Vec<Vec<PositionValue>> = kept
            .iter()
            .map(|&p| {
                plane_positions
                    .get(p)
                    .map(PlanePosition::index_values)
                    .unwrap_or_default()
            })
            .collect();
        let mut first_by_position: BTreeMap<Vec<PositionValue>, usize> = BTreeMap::new();
        for (i, values) in kept_index_values.iter().enumerate() {
            first_by_position.entry(values.clone()).or_insert(i);
        }
        let plane_order: Vec<usize> = first_by_position.values().copied().collect();
        let dimension_count = kept_index_values.first().map_or(0, Vec::len);
        let mut dimension_values: Vec<Vec<PositionValue>> = Vec::with_capacity(dimension_count);
        for d in 0..dimension_count {
            let unique: BTreeSet<PositionValue> =
                kept_index_values.iter().map(|values| values[d]).collect();
            dimension_values.push(unique.into_iter().collect());
        }

        // The label-map image combines all segments into one plane set.
        let label_planes: Option<Array3<u16>> =
            if segmentation_type == SegmentationType::LabelMap {
                Some(match &canonical {
                    CanonicalPixels::Labels(labels) => labels.mapv(|v| v as u16),
                    CanonicalPixels::Stack(stack) => combine_stack_to_labels(stack),
                    CanonicalPixels::Fractional(_) => unreachable!(
                        "float input is cast to integers for LABELMAP segmentations"
                    ),
                })
            } else {
                None
            };

        let segments_iterable: Vec<Option<u32>> =
            if segmentation_type == SegmentationType::LabelMap {
                vec![None]
            } else {
                numbers.iter().map(|&n| Some(n)).collect()
            };

        let mut pffg_items: Vec<Item> = Vec::new();
        let mut frame_buffers: Vec<Vec<u8>> = Vec::new();
        let mut binary_values: Vec<u8> = Vec::new();

        for segment in &segments_iterable {
            for &plane_index in &plane_order {
                let original_plane = kept[plane_index];
                if let Some(segment_number) = segment {
                    if omit_empty_frames
                        && !canonical.plane_has_segment(original_plane, *segment_number)
                    {
                        log::debug!(
                            "skip empty plane {plane_index} of segment #{segment_number}"
                        );
                        continue;
                    }
                    log::debug!("add plane #{plane_index} for segment #{segment_number}");
                } else {
                    log::debug!("add plane #{plane_index}");
                }

                let index_values: Vec<u32> = kept_index_values[plane_index]
                    .iter()
                    .enumerate()
                    .map(|(d, value)| {
                        dimension_values[d]
                            .binary_search(value)
                            .map(|rank| rank as u32 + 1)
                            .map_err(|_| {
                                SegmentationError::Configuration(format!(
                                    "could not rank plane {plane_index} along dimension {d}"
                                ))
                            })
                    })
                    .collect::<Result<_>>()?;

                pffg_items.push(build_pffg_item(
                    *segment,
                    &index_values,
                    plane_positions.get(kept[plane_index]),
                    &sources,
                    original_plane,
                    locations_preserved,
                    is_multiframe,
                ));

                match (&label_planes, segment) {
                    (Some(labels), _) => {
                        let plane = labels.index_axis(Axis(0), original_plane).to_owned();
                        frame_buffers.push(frame::labelmap_bytes(&plane, bits_allocated));
                    }
                    (None, Some(segment_number)) => {
                        let plane = canonical.segment_plane(
                            original_plane,
                            *segment_number,
                            segmentation_type,
                            self.max_fractional_value,
                        );
                        if segmentation_type == SegmentationType::Binary {
                            binary_values.extend(plane.iter().copied());
                        } else {
                            frame_buffers.push(plane.iter().copied().collect());
                        }
                    }
                    (None, None) => unreachable!("label planes exist for LABELMAP"),
                }
            }
        }
        let number_of_frames = pffg_items.len();

        let photometric_interpretation = match segmentation_type {
            SegmentationType::LabelMap => "PALETTE COLOR",
            _ => "MONOCHROME2",
        };
        let ctx = FrameContext {
            rows: canonical.rows() as u32,
            columns: canonical.columns() as u32,
            bits_allocated,
            bits_stored: bits_allocated,
            photometric_interpretation: photometric_interpretation.to_string(),
            pixel_representation: 0,
            samples_per_pixel: 1,
        };

        let pixel_data: Value<Item, Vec<u8>> = if encapsulated {
            let codec = self.codecs.get(&transfer_syntax_uid)?;
            let fragments: Vec<Vec<u8>> = frame_buffers
                .iter()
                .map(|buffer| encode_frame_chunk(std::slice::from_ref(buffer), codec, &ctx))
                .collect::<Result<_>>()?;
            Value::PixelSequence(PixelFragmentSequence::new(Vec::new(), fragments))
        } else {
            let mut data = if segmentation_type == SegmentationType::Binary {
                // One contiguous bit stream so packing crosses frame
                // boundaries when rows * columns is not a multiple of 8.
                frame::pack_bits(&binary_values)
            } else {
                frame_buffers.concat()
            };
            if data.len() % 2 == 1 {
                data.push(0);
            }
            Value::Primitive(PrimitiveValue::from(data))
        };

        // Assemble the dataset.
        let mut ds = Item::new_empty();
        attrs::put_str(&mut ds, tags::SOP_CLASS_UID, VR::UI, SEGMENTATION_STORAGE);
        attrs::put_str(
            &mut ds,
            tags::SOP_INSTANCE_UID,
            VR::UI,
            &*self.sop_instance_uid,
        );
        attrs::put_str(
            &mut ds,
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            &*src.study_instance_uid,
        );
        attrs::put_str(
            &mut ds,
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            &*self.series_instance_uid,
        );
        attrs::put_str(&mut ds, tags::MODALITY, VR::CS, "SEG");
        attrs::put_int_str(&mut ds, tags::SERIES_NUMBER, self.series_number);
        attrs::put_int_str(&mut ds, tags::INSTANCE_NUMBER, self.instance_number);
        attrs::put_str(&mut ds, tags::MANUFACTURER, VR::LO, &*self.manufacturer);
        attrs::put_str(
            &mut ds,
            tags::MANUFACTURER_MODEL_NAME,
            VR::LO,
            &*self.manufacturer_model_name,
        );
        attrs::put_str(
            &mut ds,
            tags::SOFTWARE_VERSIONS,
            VR::LO,
            &*self.software_versions,
        );
        attrs::put_str(
            &mut ds,
            tags::DEVICE_SERIAL_NUMBER,
            VR::LO,
            &*self.device_serial_number,
        );
        source::copy_patient_and_study(&mut ds, &source_images[0]);
        source::copy_lossy_compression(&mut ds, &source_images[0]);

        if let Some(frame_of_reference) = &src.frame_of_reference_uid {
            attrs::put_str(
                &mut ds,
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                &**frame_of_reference,
            );
            attrs::put_str(
                &mut ds,
                tags::POSITION_REFERENCE_INDICATOR,
                VR::LO,
                src.position_reference_indicator.clone().unwrap_or_default(),
            );
        }

        attrs::put_strs(
            &mut ds,
            tags::IMAGE_TYPE,
            VR::CS,
            &["DERIVED".to_string(), "PRIMARY".to_string()],
        );
        attrs::put_u16(&mut ds, tags::SAMPLES_PER_PIXEL, 1);
        attrs::put_str(
            &mut ds,
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            photometric_interpretation,
        );
        attrs::put_u16(&mut ds, tags::PIXEL_REPRESENTATION, 0);
        attrs::put_u16(&mut ds, tags::ROWS, canonical.rows() as u16);
        attrs::put_u16(&mut ds, tags::COLUMNS, canonical.columns() as u16);
        attrs::put_u16(&mut ds, tags::BITS_ALLOCATED, bits_allocated);
        attrs::put_u16(&mut ds, tags::BITS_STORED, bits_allocated);
        attrs::put_u16(&mut ds, tags::HIGH_BIT, bits_allocated.saturating_sub(1));

        let content_label = self
            .content_label
            .clone()
            .unwrap_or_else(|| format!("{}_SEG", src.modality.as_deref().unwrap_or("OT")));
        attrs::put_str(&mut ds, tags::CONTENT_LABEL, VR::CS, content_label);
        attrs::put_str(
            &mut ds,
            tags::CONTENT_DESCRIPTION,
            VR::ST,
            self.content_description.clone().unwrap_or_default(),
        );
        attrs::put_str(
            &mut ds,
            tags::CONTENT_CREATOR_NAME,
            VR::PN,
            self.content_creator_name.clone().unwrap_or_default(),
        );

        attrs::put_str(
            &mut ds,
            tags::SEGMENTATION_TYPE,
            VR::CS,
            segmentation_type.as_str(),
        );
        if segmentation_type == SegmentationType::Fractional {
            attrs::put_str(
                &mut ds,
                tags::SEGMENTATION_FRACTIONAL_TYPE,
                VR::CS,
                self.fractional_type.as_str(),
            );
            attrs::put_u16(
                &mut ds,
                tags::MAXIMUM_FRACTIONAL_VALUE,
                self.max_fractional_value,
            );
        }
        attrs::put_str(&mut ds, tags::SEGMENTS_OVERLAP, VR::CS, overlap.as_str());
        attrs::put_seq(
            &mut ds,
            tags::SEGMENT_SEQUENCE,
            segment_descriptions
                .iter()
                .map(SegmentDescription::to_item)
                .collect(),
        );

        // Dimension organization.
        let organization_uid = format!("{}.1", self.sop_instance_uid);
        let mut organization_item = Item::new_empty();
        attrs::put_str(
            &mut organization_item,
            tags::DIMENSION_ORGANIZATION_UID,
            VR::UI,
            &*organization_uid,
        );
        attrs::put_seq(
            &mut ds,
            tags::DIMENSION_ORGANIZATION_SEQUENCE,
            vec![organization_item],
        );
        let include_segment_number = segmentation_type != SegmentationType::LabelMap;
        attrs::put_seq(
            &mut ds,
            tags::DIMENSION_INDEX_SEQUENCE,
            dimension_index_items(coordinate_system, include_segment_number, &organization_uid),
        );

        // Shared functional groups.
        let mut shared = Item::new_empty();
        if let Some(measures) = &pixel_measures {
            attrs::put_seq(
                &mut shared,
                tags::PIXEL_MEASURES_SEQUENCE,
                vec![measures.to_item()],
            );
        }
        if let Some(orientation) = &plane_orientation {
            attrs::put_seq(
                &mut shared,
                tags::PLANE_ORIENTATION_SEQUENCE,
                vec![orientation.to_item()],
            );
        }
        attrs::put_seq(&mut ds, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, vec![shared]);

        // General and common-instance references.
        let mut source_image_items = Vec::new();
        let mut by_series: BTreeMap<String, Vec<Item>> = BTreeMap::new();
        for s in &sources {
            let mut reference = Item::new_empty();
            attrs::put_str(
                &mut reference,
                tags::REFERENCED_SOP_CLASS_UID,
                VR::UI,
                &*s.sop_class_uid,
            );
            attrs::put_str(
                &mut reference,
                tags::REFERENCED_SOP_INSTANCE_UID,
                VR::UI,
                &*s.sop_instance_uid,
            );
            source_image_items.push(reference.clone());
            by_series
                .entry(s.series_instance_uid.clone())
                .or_default()
                .push(reference);
        }
        attrs::put_seq(&mut ds, tags::SOURCE_IMAGE_SEQUENCE, source_image_items);
        let series_items: Vec<Item> = by_series
            .into_iter()
            .map(|(series_uid, references)| {
                let mut item = Item::new_empty();
                attrs::put_str(&mut item, tags::SERIES_INSTANCE_UID, VR::UI, series_uid);
                attrs::put_seq(&mut item, tags::REFERENCED_INSTANCE_SEQUENCE, references);
                item
            })
            .collect();
        attrs::put_seq(&mut ds, tags::REFERENCED_SERIES_SEQUENCE, series_items);

        if coordinate_system == Some(CoordinateSystem::Slide) {
            let orientation = plane_orientation.as_ref().ok_or_else(|| {
                SegmentationError::Configuration(
                    "slide segmentations require a plane orientation".into(),
                )
            })?;
            add_slide_metadata(
                &mut ds,
                &source_images[0],
                orientation,
                &plane_positions,
                pixel_measures.as_ref(),
                locations_preserved,
                src.is_tiled,
                canonical.rows() as u32,
                canonical.columns() as u32,
            )?;
        }

        attrs::put_int_str(&mut ds, tags::NUMBER_OF_FRAMES, number_of_frames as i64);
        attrs::put_seq(&mut ds, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, pffg_items);

        let pixel_data_vr = if bits_allocated > 8 { VR::OW } else { VR::OB };
        ds.put(DataElement::new(tags::PIXEL_DATA, pixel_data_vr, pixel_data));

        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(&transfer_syntax_uid)
            .media_storage_sop_class_uid(SEGMENTATION_STORAGE)
            .media_storage_sop_instance_uid(&self.sop_instance_uid)
            .build()
            .map_err(|e| {
                SegmentationError::Configuration(format!("cannot build file meta table: {e}"))
            })?;
        let mut file_object = FileDicomObject::new_empty_with_dict_and_meta(
            StandardDataDictionary,
            meta,
        );
        for element in ds {
            file_object.put(element);
        }

        // Re-parse the finished product; this builds the frame index
        // from the same records a reader would see.
        Segmentation::from_dataset_with_codecs(file_object, self.codecs)
    }
}

fn check_segment_numbers(numbers: &[u32]) -> Result<()> {
    if numbers.is_empty() {
        return Err(SegmentationError::Configuration(
            "at least one segment description is required".into(),
        ));
    }
    for (i, &number) in numbers.iter().enumerate() {
        if number != i as u32 + 1 {
            return Err(SegmentationError::Configuration(
                "segment descriptions must be numbered consecutively starting at 1".into(),
            ));
        }
    }
    Ok(())
}

/// Encode frame buffers for an encapsulated transfer syntax. Only one
/// frame may be wrapped at a time.
fn encode_frame_chunk(
    buffers: &[Vec<u8>],
    codec: &dyn frame::FrameCodec,
    ctx: &FrameContext,
) -> Result<Vec<u8>> {
    let [buffer] = buffers else {
        return Err(SegmentationError::Configuration(
            "only a single frame can be encoded at a time in encapsulated format".into(),
        ));
    };
    codec.encode(buffer, ctx)
}

fn build_pffg_item(
    segment: Option<u32>,
    index_values: &[u32],
    plane_position: Option<&PlanePosition>,
    sources: &[SourceImage],
    source_index: usize,
    locations_preserved: bool,
    is_multiframe: bool,
) -> Item {
    let mut item = Item::new_empty();

    let mut frame_content = Item::new_empty();
    let mut all_values: Vec<u32> = Vec::with_capacity(index_values.len() + 1);
    if let Some(segment_number) = segment {
        all_values.push(segment_number);
    }
    all_values.extend_from_slice(index_values);
    if !all_values.is_empty() {
        attrs::put_u32s(&mut frame_content, tags::DIMENSION_INDEX_VALUES, &all_values);
    }
    attrs::put_seq(&mut item, tags::FRAME_CONTENT_SEQUENCE, vec![frame_content]);

    if let Some(position) = plane_position {
        attrs::put_seq(
            &mut item,
            position.functional_group_tag(),
            vec![position.to_item()],
        );
    }

    if locations_preserved {
        let mut derivation = Item::new_empty();
        attrs::put_seq(
            &mut derivation,
            tags::DERIVATION_CODE_SEQUENCE,
            vec![coding::segmentation_derivation().to_item()],
        );
        let mut source_item = Item::new_empty();
        let reference = if is_multiframe {
            // Frame numbers are one-based.
            attrs::put_int_str(
                &mut source_item,
                tags::REFERENCED_FRAME_NUMBER,
                source_index as i64 + 1,
            );
            &sources[0]
        } else {
            &sources[source_index]
        };
        attrs::put_str(
            &mut source_item,
            tags::REFERENCED_SOP_CLASS_UID,
            VR::UI,
            &*reference.sop_class_uid,
        );
        attrs::put_str(
            &mut source_item,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            &*reference.sop_instance_uid,
        );
        attrs::put_seq(
            &mut source_item,
            tags::PURPOSE_OF_REFERENCE_CODE_SEQUENCE,
            vec![coding::source_image_purpose().to_item()],
        );
        attrs::put_str(
            &mut source_item,
            tags::SPATIAL_LOCATIONS_PRESERVED,
            VR::CS,
            SpatialLocationsPreserved::Yes.as_str(),
        );
        attrs::put_seq(&mut derivation, tags::SOURCE_IMAGE_SEQUENCE, vec![source_item]);
        attrs::put_seq(&mut item, tags::DERIVATION_IMAGE_SEQUENCE, vec![derivation]);
    } else {
        // Which source maps to this frame is not known; leave the
        // type-2 sequence deliberately empty and omit the flag.
        attrs::put_seq(&mut item, tags::DERIVATION_IMAGE_SEQUENCE, Vec::new());
    }

    if let Some(segment_number) = segment {
        let mut identification = Item::new_empty();
        attrs::put_u16(
            &mut identification,
            tags::REFERENCED_SEGMENT_NUMBER,
            segment_number as u16,
        );
        attrs::put_seq(
            &mut item,
            tags::SEGMENT_IDENTIFICATION_SEQUENCE,
            vec![identification],
        );
    }

    item
}

#[allow(clippy::too_many_arguments)]
fn add_slide_metadata(
    ds: &mut Item,
    source_object: &Item,
    orientation: &PlaneOrientation,
    plane_positions: &[PlanePosition],
    pixel_measures: Option<&PixelMeasures>,
    locations_preserved: bool,
    is_tiled: bool,
    rows: u32,
    columns: u32,
) -> Result<()> {
    attrs::put_ds(
        ds,
        tags::IMAGE_ORIENTATION_SLIDE,
        orientation.direction_cosines(),
    );

    if locations_preserved && is_tiled {
        for tag in [
            tags::TOTAL_PIXEL_MATRIX_ORIGIN_SEQUENCE,
            tags::TOTAL_PIXEL_MATRIX_ROWS,
            tags::TOTAL_PIXEL_MATRIX_COLUMNS,
        ] {
            if let Ok(element) = source_object.element(tag) {
                ds.put(element.clone());
            }
        }
        return Ok(());
    }
    if locations_preserved {
        if let Ok(element) = source_object.element(tags::IMAGE_CENTER_POINT_COORDINATES_SEQUENCE) {
            ds.put(element.clone());
        }
        return Ok(());
    }

    let tiles: Vec<(i32, i32, f64, f64, f64)> = plane_positions
        .iter()
        .filter_map(|position| match position {
            PlanePosition::Slide {
                column_position,
                row_position,
                x,
                y,
                z,
            } => Some((*column_position, *row_position, *x, *y, *z)),
            PlanePosition::Patient(_) => None,
        })
        .collect();
    let (first, last) = match tiles.iter().minmax_by_key(|tile| (tile.0, tile.1)) {
        MinMaxResult::NoElements => {
            return Err(SegmentationError::Configuration(
                "slide segmentations require slide plane positions".into(),
            ));
        }
        MinMaxResult::OneElement(tile) => (*tile, *tile),
        MinMaxResult::MinMax(first, last) => (*first, *last),
    };

    if is_tiled {
        let mut origin = Item::new_empty();
        attrs::put_ds(&mut origin, tags::X_OFFSET_IN_SLIDE_COORDINATE_SYSTEM, &[first.2]);
        attrs::put_ds(&mut origin, tags::Y_OFFSET_IN_SLIDE_COORDINATE_SYSTEM, &[first.3]);
        attrs::put_seq(ds, tags::TOTAL_PIXEL_MATRIX_ORIGIN_SEQUENCE, vec![origin]);
        ds.put(DataElement::new(
            tags::TOTAL_PIXEL_MATRIX_ROWS,
            VR::UL,
            PrimitiveValue::from(last.1 as u32 + rows),
        ));
        ds.put(DataElement::new(
            tags::TOTAL_PIXEL_MATRIX_COLUMNS,
            VR::UL,
            PrimitiveValue::from(last.0 as u32 + columns),
        ));
    } else {
        let measures = pixel_measures.ok_or_else(|| {
            SegmentationError::Configuration(
                "pixel measures are required to derive the slide center point".into(),
            )
        })?;
        let center = image_to_reference(
            &[[columns as f64 / 2.0, rows as f64 / 2.0]],
            orientation.direction_cosines(),
            &[first.2, first.3, first.4],
            &measures.pixel_spacing,
        );
        let mut center_item = Item::new_empty();
        attrs::put_ds(
            &mut center_item,
            tags::X_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
            &[center[0][0]],
        );
        attrs::put_ds(
            &mut center_item,
            tags::Y_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
            &[center[0][1]],
        );
        attrs::put_ds(
            &mut center_item,
            tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
            &[center[0][2]],
        );
        attrs::put_seq(ds, tags::IMAGE_CENTER_POINT_COORDINATES_SEQUENCE, vec![center_item]);
    }
    Ok(())
}

/// A segmentation image object, queryable by stored frame metadata.
#[derive(Debug)]
pub struct Segmentation {
    dataset: FileDicomObject<InMemDicomObject>,
    codecs: CodecRegistry,
    segmentation_type: SegmentationType,
    fractional_type: Option<FractionalType>,
    max_fractional_value: u16,
    segments_overlap: Option<SegmentsOverlap>,
    rows: usize,
    columns: usize,
    bits_allocated: u16,
    coordinate_system: Option<CoordinateSystem>,
    segment_descriptions: Vec<SegmentDescription>,
    dimension_index_pointers: Vec<Tag>,
    locations_preserved: Option<SpatialLocationsPreserved>,
    store: StoredFrames,
    index: FrameIndex,
}

impl Segmentation {
    /// Parse a previously encoded segmentation dataset.
    ///
    /// This is a pure conversion: the typed object shares no mutable
    /// state with the caller's view of the input.
    pub fn from_dataset(dataset: FileDicomObject<InMemDicomObject>) -> Result<Self> {
        Self::from_dataset_with_codecs(dataset, CodecRegistry::default())
    }

    /// Like [`Segmentation::from_dataset`], with caller-supplied codecs
    /// for encapsulated transfer syntaxes.
    pub fn from_dataset_with_codecs(
        dataset: FileDicomObject<InMemDicomObject>,
        codecs: CodecRegistry,
    ) -> Result<Self> {
        let transfer_syntax_uid = dataset
            .meta()
            .transfer_syntax()
            .trim_end_matches('\0')
            .to_string();
        if transfer_syntax_uid == EXPLICIT_VR_BIG_ENDIAN {
            return Err(SegmentationError::Configuration(
                "big-endian transfer syntaxes are not supported".into(),
            ));
        }
        let sop_class_uid = attrs::string(&dataset, tags::SOP_CLASS_UID).unwrap_or_default();
        if sop_class_uid != SEGMENTATION_STORAGE {
            return Err(SegmentationError::Configuration(
                "the dataset is not a Segmentation".into(),
            ));
        }

        let rows = attrs::u32_value(&dataset, tags::ROWS)
            .ok_or_else(|| SegmentationError::Integrity("missing attribute Rows".into()))?
            as usize;
        let columns = attrs::u32_value(&dataset, tags::COLUMNS)
            .ok_or_else(|| SegmentationError::Integrity("missing attribute Columns".into()))?
            as usize;
        let bits_allocated = attrs::u16_value(&dataset, tags::BITS_ALLOCATED).ok_or_else(|| {
            SegmentationError::Integrity("missing attribute BitsAllocated".into())
        })?;
        let segmentation_type = SegmentationType::parse(
            &attrs::require_string(&dataset, tags::SEGMENTATION_TYPE, "SegmentationType")?,
        )?;
        let fractional_type = attrs::string(&dataset, tags::SEGMENTATION_FRACTIONAL_TYPE)
            .map(|s| FractionalType::parse(&s))
            .transpose()?;
        let max_fractional_value = match segmentation_type {
            SegmentationType::Fractional => attrs::u16_value(
                &dataset,
                tags::MAXIMUM_FRACTIONAL_VALUE,
            )
            .ok_or_else(|| {
                SegmentationError::Integrity("missing attribute MaximumFractionalValue".into())
            })?,
            _ => 1,
        };
        let segments_overlap = attrs::string(&dataset, tags::SEGMENTS_OVERLAP)
            .map(|s| SegmentsOverlap::parse(&s))
            .transpose()?;

        let segment_descriptions: Vec<SegmentDescription> =
            attrs::items(&dataset, tags::SEGMENT_SEQUENCE)
                .ok_or_else(|| {
                    SegmentationError::Integrity("missing attribute SegmentSequence".into())
                })?
                .iter()
                .map(SegmentDescription::from_item)
                .collect::<Result<_>>()?;
        for (i, description) in segment_descriptions.iter().enumerate() {
            if description.segment_number() != i as u32 + 1 {
                return Err(SegmentationError::Configuration(
                    "segment numbers in the segmentation image must start at 1 and \
                     increase by 1 with the segment sequence"
                        .into(),
                ));
            }
        }

        // Coordinate system, recovered from the shared orientation.
        let shared_groups = attrs::items(&dataset, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE)
            .and_then(|items| items.first());
        let coordinate_system = shared_groups
            .and_then(|shared| attrs::items(shared, tags::PLANE_ORIENTATION_SEQUENCE))
            .and_then(|items| items.first())
            .and_then(|item| {
                if attrs::f64_list(item, tags::IMAGE_ORIENTATION_SLIDE).is_some() {
                    Some(CoordinateSystem::Slide)
                } else if attrs::f64_list(item, tags::IMAGE_ORIENTATION_PATIENT).is_some() {
                    Some(CoordinateSystem::Patient)
                } else {
                    None
                }
            });

        // Dimension pointers, with the segment number handled specially.
        let dimension_items = attrs::items(&dataset, tags::DIMENSION_INDEX_SEQUENCE)
            .ok_or_else(|| {
                SegmentationError::Integrity("missing attribute DimensionIndexSequence".into())
            })?;
        let mut dimension_index_pointers: Vec<Tag> = Vec::new();
        let mut pointer_positions: Vec<usize> = Vec::new();
        let mut has_segment_pointer = false;
        for (position, item) in dimension_items.iter().enumerate() {
            let pointer = attrs::tag_value(item, tags::DIMENSION_INDEX_POINTER).ok_or_else(
                || {
                    SegmentationError::Integrity(
                        "dimension index item lacks DimensionIndexPointer".into(),
                    )
                },
            )?;
            if pointer == tags::REFERENCED_SEGMENT_NUMBER {
                has_segment_pointer = true;
            } else {
                dimension_index_pointers.push(pointer);
                pointer_positions.push(position);
            }
        }
        let is_labelmap = segmentation_type == SegmentationType::LabelMap;
        if !is_labelmap && !has_segment_pointer {
            return Err(SegmentationError::Integrity(
                "the dimension index sequence lacks the segment number pointer".into(),
            ));
        }

        let study_instance_uid =
            attrs::require_string(&dataset, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
        let referenced_uids = referenced_instance_uids(&dataset, &study_instance_uid);
        let known_sops: HashSet<&str> = referenced_uids
            .iter()
            .map(|(_, _, sop)| sop.as_str())
            .collect();

        // Per-frame records.
        let frame_items = attrs::items(&dataset, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)
            .ok_or_else(|| {
                SegmentationError::Integrity(
                    "missing attribute PerFrameFunctionalGroupsSequence".into(),
                )
            })?;
        let expected_values = dimension_items.len();
        let mut rows_out: Vec<FrameRow> = Vec::with_capacity(frame_items.len());
        let mut location_votes: Vec<Option<SpatialLocationsPreserved>> = Vec::new();
        for frame_item in frame_items {
            let segment_number = if is_labelmap {
                0
            } else {
                attrs::items(frame_item, tags::SEGMENT_IDENTIFICATION_SEQUENCE)
                    .and_then(|items| items.first())
                    .and_then(|item| attrs::u32_value(item, tags::REFERENCED_SEGMENT_NUMBER))
                    .ok_or_else(|| {
                        SegmentationError::Integrity(
                            "a frame lacks its referenced segment number".into(),
                        )
                    })?
            };

            let indices = attrs::items(frame_item, tags::FRAME_CONTENT_SEQUENCE)
                .and_then(|items| items.first())
                .and_then(|item| attrs::u32_list(item, tags::DIMENSION_INDEX_VALUES))
                .unwrap_or_default();
            if indices.len() != expected_values {
                return Err(SegmentationError::Integrity(
                    "mismatch between dimension index values in the per-frame functional \
                     groups and the dimension index sequence"
                        .into(),
                ));
            }
            let dimension_index_values: Vec<u32> = pointer_positions
                .iter()
                .map(|&position| indices[position])
                .collect();

            // Contributing source references for this frame.
            let mut frame_instances: Vec<String> = Vec::new();
            let mut frame_numbers: Vec<Option<u32>> = Vec::new();
            if let Some(derivations) = attrs::items(frame_item, tags::DERIVATION_IMAGE_SEQUENCE) {
                for derivation in derivations {
                    if let Some(source_items) =
                        attrs::items(derivation, tags::SOURCE_IMAGE_SEQUENCE)
                    {
                        for source_item in source_items {
                            let uid = attrs::string(
                                source_item,
                                tags::REFERENCED_SOP_INSTANCE_UID,
                            )
                            .ok_or_else(|| {
                                SegmentationError::Integrity(
                                    "a derivation reference lacks its SOP instance UID".into(),
                                )
                            })?;
                            frame_instances.push(uid);
                            location_votes.push(
                                attrs::string(source_item, tags::SPATIAL_LOCATIONS_PRESERVED)
                                    .map(|s| SpatialLocationsPreserved::parse(&s))
                                    .transpose()?,
                            );
                            match attrs::i32_list(source_item, tags::REFERENCED_FRAME_NUMBER) {
                                Some(numbers) => frame_numbers.extend(
                                    numbers.into_iter().map(|n| u32::try_from(n).ok()),
                                ),
                                None => frame_numbers.push(None),
                            }
                        }
                    }
                }
            }

            let unique_instances: HashSet<&String> = frame_instances.iter().collect();
            let unique_frames: HashSet<&Option<u32>> = frame_numbers.iter().collect();
            let source = if unique_instances.len() == 1 && unique_frames.len() == 1 {
                let uid = frame_instances[0].clone();
                if !known_sops.contains(uid.as_str()) {
                    return Err(SegmentationError::Integrity(format!(
                        "SOP instance {uid} referenced in a source image sequence is not \
                         included in the referenced series of this object"
                    )));
                }
                Some(SourceRef {
                    sop_instance_uid: uid,
                    frame_number: frame_numbers[0],
                })
            } else {
                None
            };

            rows_out.push(FrameRow {
                segment_number,
                dimension_index_values,
                source,
            });
        }

        let locations_preserved = classify_location_votes(&location_votes);
        let number_of_frames = rows_out.len();
        let index = FrameIndex::new(referenced_uids, rows_out);

        // Stored pixel payload.
        let store = parse_pixel_data(
            &dataset,
            &transfer_syntax_uid,
            bits_allocated,
            number_of_frames,
            rows * columns,
        )?;

        Ok(Self {
            dataset,
            codecs,
            segmentation_type,
            fractional_type,
            max_fractional_value,
            segments_overlap,
            rows,
            columns,
            bits_allocated,
            coordinate_system,
            segment_descriptions,
            dimension_index_pointers,
            locations_preserved,
            store,
            index,
        })
    }

    pub fn segmentation_type(&self) -> SegmentationType {
        self.segmentation_type
    }

    pub fn fractional_type(&self) -> Option<FractionalType> {
        self.fractional_type
    }

    pub fn max_fractional_value(&self) -> u16 {
        self.max_fractional_value
    }

    pub fn segments_overlap(&self) -> Option<SegmentsOverlap> {
        self.segments_overlap
    }

    pub fn coordinate_system(&self) -> Option<CoordinateSystem> {
        self.coordinate_system
    }

    pub fn number_of_frames(&self) -> usize {
        self.index.number_of_frames()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn number_of_segments(&self) -> u32 {
        self.segment_descriptions.len() as u32
    }

    pub fn segment_numbers(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.number_of_segments()
    }

    /// The object-level spatial-locations-preserved classification:
    /// NO when any contributing reference says NO, YES when every
    /// reference voted and all said YES, unknown otherwise.
    pub fn spatial_locations_preserved(&self) -> Option<SpatialLocationsPreserved> {
        self.locations_preserved
    }

    pub fn get_segment_description(&self, segment_number: u32) -> Result<&SegmentDescription> {
        if segment_number < 1 || segment_number > self.number_of_segments() {
            return Err(SegmentationError::Lookup(format!(
                "{segment_number} is not a valid segment number for this object"
            )));
        }
        Ok(&self.segment_descriptions[segment_number as usize - 1])
    }

    /// Numbers of all segments matching every provided filter.
    pub fn get_segment_numbers(&self, criteria: &SegmentCriteria) -> Vec<u32> {
        self.segment_descriptions
            .iter()
            .filter(|description| criteria.matches(description))
            .map(SegmentDescription::segment_number)
            .collect()
    }

    /// Unique (tracking id, tracking uid) pairs over matching segments.
    pub fn get_tracking_ids(&self, criteria: &SegmentCriteria) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for description in &self.segment_descriptions {
            if !criteria.matches(description) {
                continue;
            }
            if let (Some(id), Some(uid)) =
                (description.tracking_id(), description.tracking_uid())
            {
                if seen.insert((id.to_string(), uid.to_string())) {
                    out.push((id.to_string(), uid.to_string()));
                }
            }
        }
        out
    }

    pub fn segmented_property_categories(&self) -> Vec<crate::coding::CodedConcept> {
        let mut out: Vec<crate::coding::CodedConcept> = Vec::new();
        for description in &self.segment_descriptions {
            let category = description.segmented_property_category();
            if !out.iter().any(|c| c == category) {
                out.push(category.clone());
            }
        }
        out
    }

    pub fn segmented_property_types(&self) -> Vec<crate::coding::CodedConcept> {
        let mut out: Vec<crate::coding::CodedConcept> = Vec::new();
        for description in &self.segment_descriptions {
            let prop = description.segmented_property_type();
            if !out.iter().any(|c| c == prop) {
                out.push(prop.clone());
            }
        }
        out
    }

    /// (Study, Series, SOP Instance) UID triplet of every referenced
    /// source instance.
    pub fn get_source_image_uids(&self) -> Vec<(String, String, String)> {
        self.index.referenced_uids().to_vec()
    }

    /// The dimension index pointers of this object, excluding the
    /// segment-number pointer.
    pub fn get_default_dimension_index_pointers(&self) -> Vec<Tag> {
        self.dimension_index_pointers.clone()
    }

    /// Check whether the given pointers, together with the segment
    /// number, uniquely identify frames.
    pub fn are_dimension_indices_unique(&self, pointers: &[Tag]) -> Result<bool> {
        if pointers.is_empty() {
            return Err(SegmentationError::Configuration(
                "the list of dimension index pointers may not be empty".into(),
            ));
        }
        let columns = self.pointer_columns(pointers)?;
        Ok(self.index.dimension_indices_unique(&columns))
    }

    /// Reconstruct masks for a list of single-frame source instances.
    ///
    /// Stacked output has shape `(instances, rows, columns, segments)`;
    /// with `combine_segments` the output is `(instances, rows,
    /// columns)` and pixel value encodes the segment.
    pub fn get_pixels_by_source_instance<T: MaskPixel, S: AsRef<str>>(
        &self,
        source_sop_instance_uids: &[S],
        options: &MaskOptions,
    ) -> Result<ArrayD<T>> {
        let source_sop_instance_uids: Vec<&str> = source_sop_instance_uids
            .iter()
            .map(AsRef::as_ref)
            .collect();
        self.ensure_pixel_queries_supported()?;
        self.check_indexing_by_source(options.ignore_spatial_locations)?;
        let segments = self.resolve_segments(options)?;
        if source_sop_instance_uids.is_empty() {
            return Err(SegmentationError::Configuration(
                "source SOP instance UIDs may not be empty".into(),
            ));
        }
        if !self.index.referenced_instances_unique() {
            return Err(SegmentationError::NotIndexable(
                "source SOP instance UIDs and segment numbers do not uniquely identify \
                 frames of this object"
                    .into(),
            ));
        }
        if !options.assert_missing_frames_are_empty {
            let known = self.index.referenced_sop_instance_uids();
            let missing: Vec<&str> = source_sop_instance_uids
                .iter()
                .copied()
                .filter(|uid| !known.contains(uid))
                .collect();
            if !missing.is_empty() {
                return Err(SegmentationError::Lookup(format!(
                    "SOP instance UIDs {missing:?} match no referenced source instance; \
                     set assert_missing_frames_are_empty to receive empty masks instead"
                )));
            }
        }

        let segment_map = segment_output_map(&segments, self.numbering(options))?;
        let instructions = self
            .index
            .scan_by_source_instance(&source_sop_instance_uids, &segment_map)?;
        self.materialize::<T>(
            source_sop_instance_uids.len(),
            &instructions,
            &segments,
            options,
        )
    }

    /// Reconstruct masks for frames of one multi-frame source instance.
    pub fn get_pixels_by_source_frame<T: MaskPixel>(
        &self,
        source_sop_instance_uid: &str,
        source_frame_numbers: &[u32],
        options: &MaskOptions,
    ) -> Result<ArrayD<T>> {
        self.ensure_pixel_queries_supported()?;
        self.check_indexing_by_source(options.ignore_spatial_locations)?;
        let segments = self.resolve_segments(options)?;
        if source_frame_numbers.is_empty() {
            return Err(SegmentationError::Configuration(
                "source frame numbers may not be empty".into(),
            ));
        }
        if source_frame_numbers.contains(&0) {
            return Err(SegmentationError::Configuration(
                "source frame numbers are one-based and must be positive".into(),
            ));
        }
        if !self.index.referenced_frames_unique() {
            return Err(SegmentationError::NotIndexable(
                "source frame numbers and segment numbers do not uniquely identify \
                 frames of this object"
                    .into(),
            ));
        }
        if !options.assert_missing_frames_are_empty {
            let known = self.index.referenced_sop_instance_uids();
            if !known.contains(source_sop_instance_uid) {
                return Err(SegmentationError::Lookup(format!(
                    "SOP instance UID {source_sop_instance_uid} matches no referenced \
                     source instance"
                )));
            }
            let max_frame = self.index.max_referenced_frame();
            for &frame_number in source_frame_numbers {
                if max_frame.is_none_or(|max| frame_number > max) {
                    return Err(SegmentationError::Lookup(format!(
                        "source frame {frame_number} is beyond every referenced source \
                         frame; set assert_missing_frames_are_empty to receive an empty \
                         mask instead"
                    )));
                }
            }
        }

        let segment_map = segment_output_map(&segments, self.numbering(options))?;
        let instructions = self
            .index
            .scan_by_source_frame(source_frame_numbers, &segment_map)?;
        self.materialize::<T>(source_frame_numbers.len(), &instructions, &segments, options)
    }

    /// Reconstruct masks addressed by dimension index values.
    ///
    /// `dimension_index_pointers` selects and orders the indexed
    /// dimensions each inner value vector refers to; the default is
    /// [`Segmentation::get_default_dimension_index_pointers`].
    pub fn get_pixels_by_dimension_index_values<T: MaskPixel>(
        &self,
        dimension_index_values: &[Vec<u32>],
        dimension_index_pointers: Option<&[Tag]>,
        options: &MaskOptions,
    ) -> Result<ArrayD<T>> {
        self.ensure_pixel_queries_supported()?;
        let segments = self.resolve_segments(options)?;
        let pointers: Vec<Tag> = match dimension_index_pointers {
            Some([]) => {
                return Err(SegmentationError::Configuration(
                    "the list of dimension index pointers may not be empty".into(),
                ));
            }
            Some(pointers) => pointers.to_vec(),
            None => self.dimension_index_pointers.clone(),
        };
        if dimension_index_values.is_empty() {
            return Err(SegmentationError::Configuration(
                "dimension index values may not be empty".into(),
            ));
        }
        if dimension_index_values
            .iter()
            .any(|values| values.len() != pointers.len())
        {
            return Err(SegmentationError::Configuration(
                "each dimension index value vector must hold one value per dimension \
                 index pointer"
                    .into(),
            ));
        }
        let columns = self.pointer_columns(&pointers)?;
        if !self.index.dimension_indices_unique(&columns) {
            return Err(SegmentationError::NotIndexable(
                "the chosen dimension indices do not uniquely identify frames; provide \
                 further indices to disambiguate"
                    .into(),
            ));
        }
        if !options.assert_missing_frames_are_empty {
            let known = self.index.distinct_dimension_values(&columns);
            let missing: Vec<&Vec<u32>> = dimension_index_values
                .iter()
                .filter(|values| !known.contains(*values))
                .collect();
            if !missing.is_empty() {
                return Err(SegmentationError::Lookup(format!(
                    "dimension index values {missing:?} match no frame of this object; \
                     set assert_missing_frames_are_empty to receive empty masks instead"
                )));
            }
        }

        let segment_map = segment_output_map(&segments, self.numbering(options))?;
        let instructions =
            self.index
                .scan_by_dimension_values(dimension_index_values, &columns, &segment_map)?;
        self.materialize::<T>(dimension_index_values.len(), &instructions, &segments, options)
    }

    /// Access the underlying dataset.
    pub fn dataset(&self) -> &FileDicomObject<InMemDicomObject> {
        &self.dataset
    }

    pub fn into_dataset(self) -> FileDicomObject<InMemDicomObject> {
        self.dataset
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.dataset.write_to_file(path)?;
        Ok(())
    }

    fn ensure_pixel_queries_supported(&self) -> Result<()> {
        if self.segmentation_type == SegmentationType::LabelMap {
            return Err(SegmentationError::NotIndexable(
                "LABELMAP segmentations do not carry per-segment frames".into(),
            ));
        }
        Ok(())
    }

    fn check_indexing_by_source(&self, ignore_spatial_locations: bool) -> Result<()> {
        match self.locations_preserved {
            Some(SpatialLocationsPreserved::No) if !ignore_spatial_locations => {
                return Err(SegmentationError::NotIndexable(
                    "this object states that spatial locations are not preserved; \
                     set ignore_spatial_locations to index by source frames anyway"
                        .into(),
                ));
            }
            None if !ignore_spatial_locations => {
                return Err(SegmentationError::NotIndexable(
                    "this object does not state that spatial locations are preserved; \
                     set ignore_spatial_locations to index by source frames anyway"
                        .into(),
                ));
            }
            _ => {}
        }
        if !self.index.single_source_per_frame() {
            return Err(SegmentationError::NotIndexable(
                "some frames reference zero or several source frames".into(),
            ));
        }
        Ok(())
    }

    fn resolve_segments(&self, options: &MaskOptions) -> Result<Vec<u32>> {
        let segments = options
            .segment_numbers
            .clone()
            .unwrap_or_else(|| self.segment_numbers().collect());
        if segments.is_empty() {
            return Err(SegmentationError::Configuration(
                "segment numbers may not be empty".into(),
            ));
        }
        for &segment in &segments {
            if segment < 1 || segment > self.number_of_segments() {
                return Err(SegmentationError::Lookup(format!(
                    "segment number {segment} does not exist in this object"
                )));
            }
        }
        Ok(segments)
    }

    fn numbering(&self, options: &MaskOptions) -> SegmentNumbering {
        if options.combine_segments {
            if options.relabel {
                SegmentNumbering::Relabel
            } else {
                SegmentNumbering::Identity
            }
        } else {
            SegmentNumbering::StackPosition
        }
    }

    fn pointer_columns(&self, pointers: &[Tag]) -> Result<Vec<usize>> {
        pointers
            .iter()
            .map(|pointer| {
                self.dimension_index_pointers
                    .iter()
                    .position(|p| p == pointer)
                    .ok_or_else(|| {
                        SegmentationError::Lookup(format!(
                            "tag {pointer} is not used as a dimension index in this object"
                        ))
                    })
            })
            .collect()
    }

    fn frame_context(&self) -> FrameContext {
        FrameContext {
            rows: self.rows as u32,
            columns: self.columns as u32,
            bits_allocated: self.bits_allocated,
            bits_stored: self.bits_allocated,
            photometric_interpretation: match self.segmentation_type {
                SegmentationType::LabelMap => "PALETTE COLOR".to_string(),
                _ => "MONOCHROME2".to_string(),
            },
            pixel_representation: 0,
            samples_per_pixel: 1,
        }
    }

    fn stored_plane(&self, index: usize) -> Result<Array2<u8>> {
        self.store.plane(index, &self.frame_context(), &self.codecs)
    }

    fn materialize<T: MaskPixel>(
        &self,
        num_output_frames: usize,
        instructions: &[crate::index::Instruction],
        segments: &[u32],
        options: &MaskOptions,
    ) -> Result<ArrayD<T>> {
        let is_fractional = self.segmentation_type == SegmentationType::Fractional;
        let max_output_value: u64 = if options.combine_segments {
            if options.relabel {
                segments.len() as u64
            } else {
                u64::from(segments.iter().max().copied().unwrap_or(1))
            }
        } else {
            1
        };
        let rescale_active =
            options.rescale_fractional && is_fractional && !options.combine_segments;
        validate_output_type::<T>(max_output_value, rescale_active)?;

        let fetch = |index: usize| self.stored_plane(index);
        if options.combine_segments {
            let fractional = if is_fractional {
                if !options.rescale_fractional {
                    return Err(SegmentationError::Configuration(
                        "combining segments of a fractional object requires \
                         rescale_fractional"
                            .into(),
                    ));
                }
                Some(self.max_fractional_value)
            } else {
                None
            };
            let out = combined_mask::<T>(
                (num_output_frames, self.rows, self.columns),
                instructions,
                fetch,
                fractional,
                options.skip_overlap_checks,
            )?;
            Ok(out.into_dyn())
        } else {
            let fractional = rescale_active.then_some(self.max_fractional_value);
            let out = stacked_mask::<T>(
                (num_output_frames, self.rows, self.columns, segments.len()),
                instructions,
                fetch,
                fractional,
            )?;
            Ok(out.into_dyn())
        }
    }
}

/// Vote over all contributing references: any NO wins, a unanimous and
/// non-empty YES yields YES, and anything else (including references
/// that omitted the flag) is unknown.
fn classify_location_votes(
    votes: &[Option<SpatialLocationsPreserved>],
) -> Option<SpatialLocationsPreserved> {
    if votes
        .iter()
        .any(|vote| *vote == Some(SpatialLocationsPreserved::No))
    {
        Some(SpatialLocationsPreserved::No)
    } else if !votes.is_empty()
        && votes
            .iter()
            .all(|vote| *vote == Some(SpatialLocationsPreserved::Yes))
    {
        Some(SpatialLocationsPreserved::Yes)
    } else {
        None
    }
}

/// Referenced instance triplets from the referenced-series and
/// other-studies sequences.
fn referenced_instance_uids(dataset: &Item, study_instance_uid: &str) -> Vec<(String, String, String)> {
    let mut out = Vec::new();
    if let Some(series_items) = attrs::items(dataset, tags::REFERENCED_SERIES_SEQUENCE) {
        for series_item in series_items {
            let series_uid =
                attrs::string(series_item, tags::SERIES_INSTANCE_UID).unwrap_or_default();
            if let Some(instances) =
                attrs::items(series_item, tags::REFERENCED_INSTANCE_SEQUENCE)
            {
                for instance in instances {
                    if let Some(sop) =
                        attrs::string(instance, tags::REFERENCED_SOP_INSTANCE_UID)
                    {
                        out.push((study_instance_uid.to_string(), series_uid.clone(), sop));
                    }
                }
            }
        }
    }
    if let Some(study_items) = attrs::items(
        dataset,
        tags::STUDIES_CONTAINING_OTHER_REFERENCED_INSTANCES_SEQUENCE,
    ) {
        for study_item in study_items {
            let study_uid =
                attrs::string(study_item, tags::STUDY_INSTANCE_UID).unwrap_or_default();
            if let Some(series_items) =
                attrs::items(study_item, tags::REFERENCED_SERIES_SEQUENCE)
            {
                for series_item in series_items {
                    let series_uid = attrs::string(series_item, tags::SERIES_INSTANCE_UID)
                        .unwrap_or_default();
                    if let Some(instances) =
                        attrs::items(series_item, tags::REFERENCED_INSTANCE_SEQUENCE)
                    {
                        for instance in instances {
                            if let Some(sop) =
                                attrs::string(instance, tags::REFERENCED_SOP_INSTANCE_UID)
                            {
                                out.push((study_uid.clone(), series_uid.clone(), sop));
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

fn parse_pixel_data(
    dataset: &FileDicomObject<InMemDicomObject>,
    transfer_syntax_uid: &str,
    bits_allocated: u16,
    number_of_frames: usize,
    pixels_per_frame: usize,
) -> Result<StoredFrames> {
    let element = dataset.element(tags::PIXEL_DATA).map_err(|_| {
        SegmentationError::Integrity("missing attribute PixelData".into())
    })?;
    match element.value() {
        Value::PixelSequence(sequence) => {
            let fragments: Vec<Vec<u8>> = sequence.fragments().to_vec();
            if fragments.len() != number_of_frames {
                return Err(SegmentationError::Integrity(format!(
                    "pixel data holds {} fragments for {} frames",
                    fragments.len(),
                    number_of_frames
                )));
            }
            Ok(StoredFrames::Encapsulated {
                fragments,
                transfer_syntax_uid: transfer_syntax_uid.to_string(),
            })
        }
        _ => {
            let data = element.to_bytes()?.into_owned();
            let expected_bits = number_of_frames * pixels_per_frame * bits_allocated as usize;
            if data.len() * 8 < expected_bits {
                return Err(SegmentationError::Integrity(format!(
                    "pixel data holds {} bytes but {} frames require {} bits",
                    data.len(),
                    number_of_frames,
                    expected_bits
                )));
            }
            Ok(StoredFrames::Native {
                data,
                bits_allocated,
            })
        }
    }
}

/// Read a segmentation object from a DICOM file.
pub fn segread(path: impl AsRef<Path>) -> Result<Segmentation> {
    Segmentation::from_dataset(open_file(path)?)
}

/// Read a segmentation object from a byte stream holding a DICOM file
/// data set without the 128-byte preamble.
pub fn segread_from<R: Read>(reader: R) -> Result<Segmentation> {
    Segmentation::from_dataset(dicom::object::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_numbering_must_be_contiguous_from_one() {
        assert!(check_segment_numbers(&[1, 2, 3]).is_ok());
        assert!(check_segment_numbers(&[1]).is_ok());
        assert!(matches!(
            check_segment_numbers(&[2, 3]),
            Err(SegmentationError::Configuration(_))
        ));
        assert!(matches!(
            check_segment_numbers(&[1, 3]),
            Err(SegmentationError::Configuration(_))
        ));
        assert!(matches!(
            check_segment_numbers(&[]),
            Err(SegmentationError::Configuration(_))
        ));
    }

    #[test]
    fn location_vote_rules() {
        use SpatialLocationsPreserved::{No, Yes};
        assert_eq!(classify_location_votes(&[]), None);
        assert_eq!(classify_location_votes(&[Some(Yes), Some(Yes)]), Some(Yes));
        assert_eq!(classify_location_votes(&[Some(Yes), Some(No)]), Some(No));
        assert_eq!(classify_location_votes(&[None, Some(No)]), Some(No));
        // A reference that omitted the flag pushes the vote to unknown,
        // never to YES.
        assert_eq!(classify_location_votes(&[Some(Yes), None]), None);
    }
}
