//! Materialization of requested mask arrays from stored frame planes
//! and an instruction stream.

use ndarray::{Array2, Array3, Array4};

use crate::error::{Result, SegmentationError};
use crate::index::Instruction;

/// Element types a reconstructed mask can be materialized as.
///
/// `max_countable` is the largest integer the type represents exactly;
/// the requested output type is validated against the maximum possible
/// output value before any buffer is allocated.
pub trait MaskPixel: Copy + Default + PartialOrd + 'static {
    const IS_FLOAT: bool;

    fn max_countable() -> u64;

    fn from_stored(raw: u8) -> Self;

    fn from_segment(value: u32) -> Self;

    /// Rescaled fractional value `raw / max_fractional_value`.
    fn from_fraction(raw: u8, max_fractional_value: u16) -> Self;
}

impl MaskPixel for u8 {
    const IS_FLOAT: bool = false;

    fn max_countable() -> u64 {
        u8::MAX as u64
    }

    fn from_stored(raw: u8) -> Self {
        raw
    }

    fn from_segment(value: u32) -> Self {
        value as u8
    }

    fn from_fraction(raw: u8, _max_fractional_value: u16) -> Self {
        raw
    }
}

impl MaskPixel for u16 {
    const IS_FLOAT: bool = false;

    fn max_countable() -> u64 {
        u16::MAX as u64
    }

    fn from_stored(raw: u8) -> Self {
        raw.into()
    }

    fn from_segment(value: u32) -> Self {
        value as u16
    }

    fn from_fraction(raw: u8, _max_fractional_value: u16) -> Self {
        raw.into()
    }
}

impl MaskPixel for u32 {
    const IS_FLOAT: bool = false;

    fn max_countable() -> u64 {
        u32::MAX as u64
    }

    fn from_stored(raw: u8) -> Self {
        raw.into()
    }

    fn from_segment(value: u32) -> Self {
        value
    }

    fn from_fraction(raw: u8, _max_fractional_value: u16) -> Self {
        raw.into()
    }
}

impl MaskPixel for f32 {
    const IS_FLOAT: bool = true;

    fn max_countable() -> u64 {
        // Largest integer represented exactly by an f32.
        1 << 24
    }

    fn from_stored(raw: u8) -> Self {
        raw.into()
    }

    fn from_segment(value: u32) -> Self {
        value as f32
    }

    fn from_fraction(raw: u8, max_fractional_value: u16) -> Self {
        f32::from(raw) / f32::from(max_fractional_value)
    }
}

impl MaskPixel for f64 {
    const IS_FLOAT: bool = true;

    fn max_countable() -> u64 {
        1 << 53
    }

    fn from_stored(raw: u8) -> Self {
        raw.into()
    }

    fn from_segment(value: u32) -> Self {
        value.into()
    }

    fn from_fraction(raw: u8, max_fractional_value: u16) -> Self {
        f64::from(raw) / f64::from(max_fractional_value)
    }
}

/// Reject an output type too narrow for the maximum possible output
/// value, or an integer type when fractional rescaling is active.
pub(crate) fn validate_output_type<T: MaskPixel>(
    max_output_value: u64,
    rescale_active: bool,
) -> Result<()> {
    if rescale_active && !T::IS_FLOAT {
        return Err(SegmentationError::Configuration(
            "rescaled fractional masks require a floating-point output type".into(),
        ));
    }
    if max_output_value > T::max_countable() {
        return Err(SegmentationError::Configuration(format!(
            "the maximum output value {max_output_value} does not fit the requested output type"
        )));
    }
    Ok(())
}

/// Stacked reconstruction: one binary (or fractional) plane per
/// requested segment, stacked along the last axis.
///
/// `fractional` carries the declared maximum fractional value when the
/// stored data is fractional and rescaling was requested; stored values
/// above that maximum are an integrity failure.
pub(crate) fn stacked_mask<T: MaskPixel>(
    shape: (usize, usize, usize, usize),
    instructions: &[Instruction],
    mut fetch: impl FnMut(usize) -> Result<Array2<u8>>,
    fractional: Option<u16>,
) -> Result<Array4<T>> {
    let mut out = Array4::<T>::default(shape);
    for instruction in instructions {
        let plane = fetch(instruction.stored_frame)?;
        let segment = instruction.output_segment as usize;
        for ((r, c), &raw) in plane.indexed_iter() {
            let value = match fractional {
                Some(max_fractional_value) => {
                    if u16::from(raw) > max_fractional_value {
                        return Err(SegmentationError::Integrity(format!(
                            "stored value {raw} exceeds the declared maximum fractional \
                             value {max_fractional_value}"
                        )));
                    }
                    T::from_fraction(raw, max_fractional_value)
                }
                None => T::from_stored(raw),
            };
            out[[instruction.output_frame, r, c, segment]] = value;
        }
    }
    Ok(out)
}

/// Combined reconstruction: a label map per output frame in which pixel
/// value equals output segment number.
///
/// `fractional` carries the declared maximum fractional value when the
/// stored data is fractional; such planes must be provably binary
/// (values 0 or the maximum only). Unless checks are skipped, writing a
/// pixel already claimed by another segment in the same output frame is
/// an integrity failure; with checks skipped the higher output segment
/// number wins.
pub(crate) fn combined_mask<T: MaskPixel>(
    shape: (usize, usize, usize),
    instructions: &[Instruction],
    mut fetch: impl FnMut(usize) -> Result<Array2<u8>>,
    fractional: Option<u16>,
    skip_overlap_checks: bool,
) -> Result<Array3<T>> {
    let mut out = Array3::<T>::default(shape);
    let zero = T::default();
    for instruction in instructions {
        let plane = fetch(instruction.stored_frame)?;
        let plane = match fractional {
            Some(max_fractional_value) => binarize_fractional(plane, max_fractional_value)?,
            None => plane,
        };
        if !skip_overlap_checks {
            let frame = instruction.output_frame;
            let collision = plane
                .indexed_iter()
                .any(|((r, c), &raw)| raw != 0 && out[[frame, r, c]] > zero);
            if collision {
                return Err(SegmentationError::Integrity(
                    "cannot combine segments because segments overlap".into(),
                ));
            }
        }
        let value = T::from_segment(instruction.output_segment);
        for ((r, c), &raw) in plane.indexed_iter() {
            if raw != 0 && value > out[[instruction.output_frame, r, c]] {
                out[[instruction.output_frame, r, c]] = value;
            }
        }
    }
    Ok(out)
}

fn binarize_fractional(plane: Array2<u8>, max_fractional_value: u16) -> Result<Array2<u8>> {
    let max = max_fractional_value;
    if plane.iter().any(|&v| v != 0 && u16::from(v) != max) {
        return Err(SegmentationError::Configuration(format!(
            "combining fractional segments requires stored values of only 0 and {max}"
        )));
    }
    Ok(plane.mapv(|v| (v != 0) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn planes() -> Vec<Array2<u8>> {
        vec![
            array![[1u8, 0], [0, 0]],
            array![[0u8, 1], [0, 1]],
            array![[1u8, 1], [0, 0]],
        ]
    }

    fn fetch(planes: &[Array2<u8>]) -> impl FnMut(usize) -> Result<Array2<u8>> + '_ {
        |i| Ok(planes[i].clone())
    }

    fn instruction(output_frame: usize, stored_frame: usize, output_segment: u32) -> Instruction {
        Instruction {
            output_frame,
            stored_frame,
            output_segment,
        }
    }

    #[test]
    fn stacked_copies_planes_into_segment_slots() {
        let planes = planes();
        let out: Array4<u8> = stacked_mask(
            (1, 2, 2, 2),
            &[instruction(0, 0, 0), instruction(0, 1, 1)],
            fetch(&planes),
            None,
        )
        .unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 1);
        assert_eq!(out[[0, 0, 1, 1]], 1);
        assert_eq!(out[[0, 1, 1, 1]], 1);
        assert_eq!(out[[0, 0, 1, 0]], 0);
    }

    #[test]
    fn stacked_rescales_fractional_values() {
        let planes = vec![array![[0u8, 200]]];
        let out: Array4<f32> =
            stacked_mask((1, 1, 2, 1), &[instruction(0, 0, 0)], fetch(&planes), Some(200))
                .unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out[[0, 0, 1, 0]], 1.0);
    }

    #[test]
    fn stacked_detects_values_above_declared_maximum() {
        let planes = vec![array![[0u8, 201]]];
        let result: Result<Array4<f32>> =
            stacked_mask((1, 1, 2, 1), &[instruction(0, 0, 0)], fetch(&planes), Some(200));
        assert!(matches!(result, Err(SegmentationError::Integrity(_))));
    }

    #[test]
    fn combined_writes_segment_numbers() {
        let planes = planes();
        let out: Array3<u8> = combined_mask(
            (1, 2, 2),
            &[instruction(0, 0, 1), instruction(0, 1, 2)],
            fetch(&planes),
            None,
            false,
        )
        .unwrap();
        assert_eq!(out, array![[[1u8, 2], [0, 2]]]);
    }

    #[test]
    fn combined_detects_overlap() {
        let planes = planes();
        let result: Result<Array3<u8>> = combined_mask(
            (1, 2, 2),
            &[instruction(0, 0, 1), instruction(0, 2, 2)],
            fetch(&planes),
            None,
            false,
        );
        assert!(matches!(result, Err(SegmentationError::Integrity(_))));
    }

    #[test]
    fn skipped_overlap_checks_let_higher_segment_win() {
        let planes = planes();
        let out: Array3<u8> = combined_mask(
            (1, 2, 2),
            &[instruction(0, 2, 2), instruction(0, 0, 1)],
            fetch(&planes),
            None,
            true,
        )
        .unwrap();
        // Pixel (0, 0) is claimed by both; segment 2 wins despite the
        // later write of segment 1.
        assert_eq!(out[[0, 0, 0]], 2);
    }

    #[test]
    fn combined_fractional_requires_binary_planes() {
        let planes = vec![array![[0u8, 128]]];
        let result: Result<Array3<u8>> = combined_mask(
            (1, 1, 2),
            &[instruction(0, 0, 1)],
            fetch(&planes),
            Some(255),
            false,
        );
        assert!(matches!(result, Err(SegmentationError::Configuration(_))));
    }

    #[test]
    fn output_type_validation() {
        assert!(validate_output_type::<u8>(255, false).is_ok());
        assert!(validate_output_type::<u8>(256, false).is_err());
        assert!(validate_output_type::<u16>(256, false).is_ok());
        assert!(validate_output_type::<u8>(1, true).is_err());
        assert!(validate_output_type::<f32>(1, true).is_ok());
    }
}
