//! Validation and canonicalization of caller-supplied mask arrays, and
//! extraction of the per-segment planes that become stored frames.

use ndarray::{Array2, Array3, Array4, ArrayD, Axis, Ix3, Ix4, s};

use crate::enums::{SegmentationType, SegmentsOverlap};
use crate::error::{Result, SegmentationError};

/// Smallest unsigned width (in bits) that holds `max_value`.
pub(crate) fn smallest_unsigned_bits(max_value: u64) -> u16 {
    if max_value < 256 {
        8
    } else if max_value < 65536 {
        16
    } else {
        32
    }
}

/// A caller-supplied mask array.
///
/// Two- and three-dimensional integer arrays are label maps (pixel value
/// equals segment number); four-dimensional arrays stack binary
/// per-segment masks along the last axis; floating-point arrays hold
/// fractional occupancy or probability values in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub enum PixelArray {
    Bool(ArrayD<bool>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl From<ArrayD<bool>> for PixelArray {
    fn from(a: ArrayD<bool>) -> Self {
        PixelArray::Bool(a)
    }
}

impl From<ArrayD<u8>> for PixelArray {
    fn from(a: ArrayD<u8>) -> Self {
        PixelArray::U8(a)
    }
}

impl From<ArrayD<u16>> for PixelArray {
    fn from(a: ArrayD<u16>) -> Self {
        PixelArray::U16(a)
    }
}

impl From<ArrayD<u32>> for PixelArray {
    fn from(a: ArrayD<u32>) -> Self {
        PixelArray::U32(a)
    }
}

impl From<ArrayD<f32>> for PixelArray {
    fn from(a: ArrayD<f32>) -> Self {
        PixelArray::F32(a)
    }
}

impl From<ArrayD<f64>> for PixelArray {
    fn from(a: ArrayD<f64>) -> Self {
        PixelArray::F64(a)
    }
}

/// Canonical, per-frame-ready form of the input array.
#[derive(Debug, Clone)]
pub(crate) enum CanonicalPixels {
    /// Label map: pixel value equals segment number, 0 is background.
    Labels(Array3<u32>),
    /// Binary masks stacked along the last axis, one per segment.
    Stack(Array4<u8>),
    /// Fractional masks in `[0.0, 1.0]` stacked along the last axis.
    Fractional(Array4<f64>),
}

impl CanonicalPixels {
    pub(crate) fn num_planes(&self) -> usize {
        match self {
            CanonicalPixels::Labels(a) => a.dim().0,
            CanonicalPixels::Stack(a) => a.dim().0,
            CanonicalPixels::Fractional(a) => a.dim().0,
        }
    }

    pub(crate) fn rows(&self) -> usize {
        match self {
            CanonicalPixels::Labels(a) => a.dim().1,
            CanonicalPixels::Stack(a) => a.dim().1,
            CanonicalPixels::Fractional(a) => a.dim().1,
        }
    }

    pub(crate) fn columns(&self) -> usize {
        match self {
            CanonicalPixels::Labels(a) => a.dim().2,
            CanonicalPixels::Stack(a) => a.dim().2,
            CanonicalPixels::Fractional(a) => a.dim().2,
        }
    }

    /// True when the plane holds no non-zero pixel in any segment.
    pub(crate) fn plane_is_empty(&self, plane: usize) -> bool {
        match self {
            CanonicalPixels::Labels(a) => a.index_axis(Axis(0), plane).iter().all(|&v| v == 0),
            CanonicalPixels::Stack(a) => a.index_axis(Axis(0), plane).iter().all(|&v| v == 0),
            CanonicalPixels::Fractional(a) => {
                a.index_axis(Axis(0), plane).iter().all(|&v| v == 0.0)
            }
        }
    }

    /// True when the given segment has any non-zero pixel in the plane.
    pub(crate) fn plane_has_segment(&self, plane: usize, segment_number: u32) -> bool {
        let seg = segment_number as usize - 1;
        match self {
            CanonicalPixels::Labels(a) => a
                .index_axis(Axis(0), plane)
                .iter()
                .any(|&v| v == segment_number),
            CanonicalPixels::Stack(a) => a.slice(s![plane, .., .., seg]).iter().any(|&v| v != 0),
            CanonicalPixels::Fractional(a) => {
                a.slice(s![plane, .., .., seg]).iter().any(|&v| v != 0.0)
            }
        }
    }

    /// The stored 8-bit plane for one segment.
    ///
    /// Fractional values are scaled by round-to-nearest multiplication
    /// with the maximum fractional value; binary values destined for a
    /// fractional object are stretched by the same factor.
    pub(crate) fn segment_plane(
        &self,
        plane: usize,
        segment_number: u32,
        segmentation_type: SegmentationType,
        max_fractional_value: u16,
    ) -> Array2<u8> {
        let stretch = if segmentation_type == SegmentationType::Fractional {
            max_fractional_value as u8
        } else {
            1
        };
        match self {
            CanonicalPixels::Labels(a) => a
                .index_axis(Axis(0), plane)
                .mapv(|v| (v == segment_number) as u8 * stretch),
            CanonicalPixels::Stack(a) => a
                .slice(s![plane, .., .., segment_number as usize - 1])
                .mapv(|v| v * stretch),
            CanonicalPixels::Fractional(a) => a
                .slice(s![plane, .., .., segment_number as usize - 1])
                .mapv(|v| (v * max_fractional_value as f64).round() as u8),
        }
    }
}

fn to_unsigned(array: PixelArray) -> std::result::Result<ArrayD<u32>, PixelArray> {
    match array {
        PixelArray::Bool(a) => Ok(a.mapv(u32::from)),
        PixelArray::U8(a) => Ok(a.mapv(u32::from)),
        PixelArray::U16(a) => Ok(a.mapv(u32::from)),
        PixelArray::U32(a) => Ok(a),
        other => Err(other),
    }
}

fn promote(array: ArrayD<u32>) -> Result<ArrayD<u32>> {
    match array.ndim() {
        2 => Ok(array.insert_axis(Axis(0))),
        3 | 4 => Ok(array),
        n => Err(SegmentationError::Configuration(format!(
            "pixel array must be 2-, 3- or 4-dimensional, got {n} dimensions"
        ))),
    }
}

fn promote_float(array: ArrayD<f64>) -> Result<ArrayD<f64>> {
    match array.ndim() {
        2 => Ok(array.insert_axis(Axis(0))),
        3 | 4 => Ok(array),
        n => Err(SegmentationError::Configuration(format!(
            "pixel array must be 2-, 3- or 4-dimensional, got {n} dimensions"
        ))),
    }
}

fn stack_overlap(stack: &Array4<u8>) -> SegmentsOverlap {
    if stack.dim().3 == 1 {
        return SegmentsOverlap::No;
    }
    let overlapping = stack
        .lanes(Axis(3))
        .into_iter()
        .any(|lane| lane.iter().map(|&v| v as u32).sum::<u32>() > 1);
    if overlapping {
        SegmentsOverlap::Yes
    } else {
        SegmentsOverlap::No
    }
}

/// Validate and canonicalize the input array, and classify segment
/// overlap. Overlap is genuinely computed only for multi-segment
/// stacked input; label maps are overlap-free by construction, and a
/// truly fractional multi-segment array is `UNDEFINED`.
pub(crate) fn normalize_pixel_array(
    array: PixelArray,
    number_of_segments: u32,
    segmentation_type: SegmentationType,
) -> Result<(CanonicalPixels, SegmentsOverlap)> {
    let (canonical, overlap) = match to_unsigned(array) {
        Ok(ints) => normalize_unsigned(promote(ints)?, number_of_segments)?,
        Err(PixelArray::F32(a)) => {
            normalize_float(promote_float(a.mapv(f64::from))?, number_of_segments, segmentation_type)?
        }
        Err(PixelArray::F64(a)) => {
            normalize_float(promote_float(a)?, number_of_segments, segmentation_type)?
        }
        Err(_) => unreachable!("integer arrays handled above"),
    };

    if segmentation_type == SegmentationType::LabelMap && overlap == SegmentsOverlap::Yes {
        return Err(SegmentationError::Configuration(
            "segments may not overlap in a LABELMAP segmentation".into(),
        ));
    }
    Ok((canonical, overlap))
}

fn normalize_unsigned(
    array: ArrayD<u32>,
    number_of_segments: u32,
) -> Result<(CanonicalPixels, SegmentsOverlap)> {
    if array.ndim() == 4 {
        let stack = array
            .into_dimensionality::<Ix4>()
            .expect("rank checked above");
        if stack.dim().3 != number_of_segments as usize {
            return Err(SegmentationError::Configuration(format!(
                "the pixel array stacks {} segments but {} are described",
                stack.dim().3,
                number_of_segments
            )));
        }
        if stack.iter().any(|&v| v > 1) {
            return Err(SegmentationError::Configuration(
                "a 4-dimensional integer pixel array must be binary".into(),
            ));
        }
        let stack = stack.mapv(|v| v as u8);
        let overlap = stack_overlap(&stack);
        Ok((CanonicalPixels::Stack(stack), overlap))
    } else {
        let labels = array
            .into_dimensionality::<Ix3>()
            .expect("rank checked above");
        let max = labels.iter().copied().max().unwrap_or(0);
        if max > number_of_segments {
            return Err(SegmentationError::Configuration(
                "pixel array contains segments that lack descriptions".into(),
            ));
        }
        // Pixel value equals segment number, so segments cannot overlap.
        Ok((CanonicalPixels::Labels(labels), SegmentsOverlap::No))
    }
}

fn normalize_float(
    array: ArrayD<f64>,
    number_of_segments: u32,
    segmentation_type: SegmentationType,
) -> Result<(CanonicalPixels, SegmentsOverlap)> {
    if array.ndim() == 4 && array.shape()[3] != number_of_segments as usize {
        return Err(SegmentationError::Configuration(format!(
            "the pixel array stacks {} segments but {} are described",
            array.shape()[3],
            number_of_segments
        )));
    }
    if array.iter().any(|&v| !(0.0..=1.0).contains(&v)) {
        return Err(SegmentationError::Configuration(
            "floating-point pixel values must lie in [0.0, 1.0]".into(),
        ));
    }

    if matches!(
        segmentation_type,
        SegmentationType::Binary | SegmentationType::LabelMap
    ) {
        if array.iter().any(|&v| v != 0.0 && v != 1.0) {
            return Err(SegmentationError::Configuration(
                "floating-point pixel values must be exactly 0.0 or 1.0 for \
                 BINARY or LABELMAP segmentations"
                    .into(),
            ));
        }
        let ints = array.mapv(|v| v as u8);
        if ints.ndim() == 4 {
            let stack = ints
                .into_dimensionality::<Ix4>()
                .expect("rank checked above");
            let overlap = stack_overlap(&stack);
            Ok((CanonicalPixels::Stack(stack), overlap))
        } else {
            let labels = ints
                .into_dimensionality::<Ix3>()
                .expect("rank checked above")
                .mapv(u32::from);
            Ok((CanonicalPixels::Labels(labels), SegmentsOverlap::No))
        }
    } else {
        let stack = if array.ndim() == 3 {
            if number_of_segments != 1 {
                return Err(SegmentationError::Configuration(
                    "a 3-dimensional fractional array encodes a single segment; \
                     stack segments along a fourth axis"
                        .into(),
                ));
            }
            array
                .insert_axis(Axis(3))
                .into_dimensionality::<Ix4>()
                .expect("rank checked above")
        } else {
            array
                .into_dimensionality::<Ix4>()
                .expect("rank checked above")
        };

        let overlap = if stack.dim().3 == 1 || stack.iter().all(|&v| v == 0.0) {
            SegmentsOverlap::No
        } else if stack.iter().all(|&v| v == 0.0 || v == 1.0) {
            let binary = stack.mapv(|v| v as u8);
            stack_overlap(&binary)
        } else {
            // Truly fractional multi-segment data; overlap has no
            // meaningful definition.
            SegmentsOverlap::Undefined
        };
        Ok((CanonicalPixels::Fractional(stack), overlap))
    }
}

/// Collapse a binary stack into a label map in the requested width.
/// When checks were not skipped the stack is overlap-free, so the
/// highest set segment wins deterministically.
pub(crate) fn combine_stack_to_labels(stack: &Array4<u8>) -> Array3<u16> {
    let (planes, rows, columns, segments) = stack.dim();
    let mut labels = Array3::<u16>::zeros((planes, rows, columns));
    for p in 0..planes {
        for r in 0..rows {
            for c in 0..columns {
                for seg in (0..segments).rev() {
                    if stack[[p, r, c, seg]] != 0 {
                        labels[[p, r, c]] = (seg + 1) as u16;
                        break;
                    }
                }
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn width_selector() {
        assert_eq!(smallest_unsigned_bits(0), 8);
        assert_eq!(smallest_unsigned_bits(255), 8);
        assert_eq!(smallest_unsigned_bits(256), 16);
        assert_eq!(smallest_unsigned_bits(65535), 16);
        assert_eq!(smallest_unsigned_bits(65536), 32);
    }

    #[test]
    fn two_dimensional_input_becomes_single_plane() {
        let mask = array![[0u8, 1], [1, 0]].into_dyn();
        let (canon, overlap) =
            normalize_pixel_array(mask.into(), 1, SegmentationType::Binary).unwrap();
        assert_eq!(canon.num_planes(), 1);
        assert_eq!(overlap, SegmentsOverlap::No);
    }

    #[test]
    fn five_dimensional_input_rejected() {
        let mask = ArrayD::<u8>::zeros(vec![1, 1, 2, 2, 2]);
        let result = normalize_pixel_array(mask.into(), 2, SegmentationType::Binary);
        assert!(matches!(result, Err(SegmentationError::Configuration(_))));
    }

    #[test]
    fn label_map_requires_descriptions() {
        let mask = array![[[0u8, 3], [1, 2]]].into_dyn();
        let err = normalize_pixel_array(mask.clone().into(), 2, SegmentationType::Binary);
        assert!(matches!(err, Err(SegmentationError::Configuration(_))));
        let ok = normalize_pixel_array(mask.into(), 3, SegmentationType::Binary);
        assert!(ok.is_ok());
    }

    #[test]
    fn four_dimensional_stack_must_be_binary() {
        let mut stack = Array4::<u8>::zeros((1, 2, 2, 2));
        stack[[0, 0, 0, 0]] = 2;
        let result =
            normalize_pixel_array(stack.into_dyn().into(), 2, SegmentationType::Binary);
        assert!(matches!(result, Err(SegmentationError::Configuration(_))));
    }

    #[test]
    fn stack_size_must_match_described_segments() {
        let mask = ArrayD::<u8>::zeros(vec![1, 2, 2, 3]);
        let result = normalize_pixel_array(mask.into(), 2, SegmentationType::Binary);
        assert!(matches!(result, Err(SegmentationError::Configuration(_))));
    }

    #[test]
    fn overlap_detected_in_stacks() {
        // Both segments set pixel (1, 1).
        let mut stack = Array4::<u8>::zeros((1, 4, 4, 2));
        stack[[0, 1, 1, 0]] = 1;
        stack[[0, 1, 1, 1]] = 1;
        let (_, overlap) =
            normalize_pixel_array(stack.clone().into_dyn().into(), 2, SegmentationType::Binary)
                .unwrap();
        assert_eq!(overlap, SegmentsOverlap::Yes);

        // Disjoint segments.
        stack[[0, 1, 1, 1]] = 0;
        stack[[0, 2, 2, 1]] = 1;
        let (_, overlap) =
            normalize_pixel_array(stack.into_dyn().into(), 2, SegmentationType::Binary).unwrap();
        assert_eq!(overlap, SegmentsOverlap::No);

        // A single segment never overlaps, whatever its content.
        let ones = Array4::<u8>::ones((1, 4, 4, 1));
        let (_, overlap) =
            normalize_pixel_array(ones.into_dyn().into(), 1, SegmentationType::Binary).unwrap();
        assert_eq!(overlap, SegmentsOverlap::No);
    }

    #[test]
    fn labelmap_type_rejects_overlap() {
        let mut stack = Array4::<u8>::zeros((1, 2, 2, 2));
        stack[[0, 0, 0, 0]] = 1;
        stack[[0, 0, 0, 1]] = 1;
        let result =
            normalize_pixel_array(stack.into_dyn().into(), 2, SegmentationType::LabelMap);
        assert!(matches!(result, Err(SegmentationError::Configuration(_))));
    }

    #[test]
    fn float_bounds_and_binary_rules() {
        let bad = array![[[1.5f64, 0.0]]].into_dyn();
        assert!(normalize_pixel_array(bad.into(), 1, SegmentationType::Fractional).is_err());

        let halves = array![[[0.5f64, 0.0]]].into_dyn();
        assert!(normalize_pixel_array(halves.clone().into(), 1, SegmentationType::Binary).is_err());
        assert!(normalize_pixel_array(halves.into(), 1, SegmentationType::Fractional).is_ok());
    }

    #[test]
    fn fractional_multi_segment_overlap_undefined() {
        let mut stack = Array4::<f64>::zeros((1, 2, 2, 2));
        stack[[0, 0, 0, 0]] = 0.4;
        stack[[0, 0, 0, 1]] = 0.7;
        let (_, overlap) =
            normalize_pixel_array(stack.into_dyn().into(), 2, SegmentationType::Fractional)
                .unwrap();
        assert_eq!(overlap, SegmentsOverlap::Undefined);

        // Binary-valued floats still get a genuine answer.
        let mut stack = Array4::<f64>::zeros((1, 2, 2, 2));
        stack[[0, 0, 0, 0]] = 1.0;
        stack[[0, 0, 0, 1]] = 1.0;
        let (_, overlap) =
            normalize_pixel_array(stack.into_dyn().into(), 2, SegmentationType::Fractional)
                .unwrap();
        assert_eq!(overlap, SegmentsOverlap::Yes);
    }

    #[test]
    fn fractional_scaling_rounds_to_nearest() {
        let stack =
            Array4::from_shape_vec((1, 2, 2, 1), vec![0.0f64, 0.5, 0.998, 1.0]).unwrap();
        let (canon, _) =
            normalize_pixel_array(stack.into_dyn().into(), 1, SegmentationType::Fractional)
                .unwrap();
        let plane = canon.segment_plane(0, 1, SegmentationType::Fractional, 255);
        assert_eq!(plane, array![[0u8, 128], [254, 255]]);
    }

    #[test]
    fn binary_input_stretches_for_fractional_output() {
        let labels = array![[[0u8, 1]]].into_dyn();
        let (canon, _) =
            normalize_pixel_array(labels.into(), 1, SegmentationType::Fractional).unwrap();
        let plane = canon.segment_plane(0, 1, SegmentationType::Fractional, 200);
        assert_eq!(plane, array![[0u8, 200]]);
    }

    #[test]
    fn label_plane_extraction() {
        let labels = array![[[0u8, 2], [1, 2]]].into_dyn();
        let (canon, _) = normalize_pixel_array(labels.into(), 2, SegmentationType::Binary).unwrap();
        assert_eq!(
            canon.segment_plane(0, 2, SegmentationType::Binary, 1),
            array![[0u8, 1], [0, 1]]
        );
        assert!(canon.plane_has_segment(0, 1));
        assert!(!canon.plane_is_empty(0));
    }

    #[test]
    fn stack_combines_into_labels() {
        let mut stack = Array4::<u8>::zeros((1, 2, 2, 3));
        stack[[0, 0, 0, 0]] = 1;
        stack[[0, 0, 1, 1]] = 1;
        stack[[0, 1, 1, 2]] = 1;
        let labels = combine_stack_to_labels(&stack);
        assert_eq!(labels, array![[[1u16, 2], [0, 3]]]);
    }
}
