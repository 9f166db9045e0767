//! Mapping between image pixel indices and the three-dimensional frame
//! of reference.

/// Map (column, row) pixel coordinates into the frame of reference.
///
/// `image_orientation` holds the row direction cosines followed by the
/// column direction cosines; `pixel_spacing` is (spacing between rows,
/// spacing between columns), matching the attribute order in the
/// dataset.
pub fn image_to_reference(
    points: &[[f64; 2]],
    image_orientation: &[f64; 6],
    image_position: &[f64; 3],
    pixel_spacing: &[f64; 2],
) -> Vec<[f64; 3]> {
    let row_dir = [
        image_orientation[0],
        image_orientation[1],
        image_orientation[2],
    ];
    let col_dir = [
        image_orientation[3],
        image_orientation[4],
        image_orientation[5],
    ];
    points
        .iter()
        .map(|[column, row]| {
            let mut out = [0.0; 3];
            for axis in 0..3 {
                out[axis] = image_position[axis]
                    + column * pixel_spacing[1] * row_dir[axis]
                    + row * pixel_spacing[0] * col_dir[axis];
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_orientation() {
        let points = [[2.0, 3.0]];
        let out = image_to_reference(
            &points,
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            &[10.0, 20.0, 5.0],
            &[0.5, 0.25],
        );
        // column moves along x by column spacing, row along y by row spacing
        assert_eq!(out[0], [10.0 + 2.0 * 0.25, 20.0 + 3.0 * 0.5, 5.0]);
    }

    #[test]
    fn oblique_orientation() {
        let out = image_to_reference(
            &[[1.0, 0.0]],
            &[0.0, 1.0, 0.0, -1.0, 0.0, 0.0],
            &[0.0, 0.0, 0.0],
            &[1.0, 2.0],
        );
        assert_eq!(out[0], [0.0, 2.0, 0.0]);
    }
}
