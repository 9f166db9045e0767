//! Frame-level pixel plumbing: DICOM 1-bit packing, label-map plane
//! serialization, the frame codec seam for encapsulated transfer
//! syntaxes, and access to stored frames without decoding their
//! neighbors.

use std::collections::HashMap;

use ndarray::Array2;

use crate::error::{Result, SegmentationError};
use crate::rle::RleLosslessCodec;

pub(crate) const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub(crate) const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub(crate) const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
pub(crate) const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
pub(crate) const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
pub(crate) const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";

pub(crate) fn is_encapsulated(transfer_syntax_uid: &str) -> bool {
    !matches!(
        transfer_syntax_uid,
        IMPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_BIG_ENDIAN
    )
}

/// Image-level parameters a codec needs to interpret a frame buffer.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub rows: u32,
    pub columns: u32,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub photometric_interpretation: String,
    pub pixel_representation: u16,
    pub samples_per_pixel: u16,
}

/// A pixel-data codec for one encapsulated transfer syntax.
///
/// Frames cross this boundary as native little-endian byte buffers of
/// `rows * columns * bits_allocated / 8` bytes.
pub trait FrameCodec: Send + Sync {
    /// Compress a single native frame buffer.
    fn encode(&self, frame: &[u8], ctx: &FrameContext) -> Result<Vec<u8>>;

    /// Decompress a single frame back into its native buffer.
    fn decode(&self, encoded: &[u8], ctx: &FrameContext) -> Result<Vec<u8>>;
}

/// Codecs available for encapsulated transfer syntaxes, keyed by UID.
///
/// RLE Lossless is built in; other lossless codecs (JPEG 2000, JPEG-LS)
/// may be registered by the caller.
pub struct CodecRegistry {
    codecs: HashMap<String, Box<dyn FrameCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut codecs: HashMap<String, Box<dyn FrameCodec>> = HashMap::new();
        codecs.insert(RLE_LOSSLESS.to_string(), Box::new(RleLosslessCodec));
        Self { codecs }
    }
}

impl CodecRegistry {
    pub fn register(&mut self, transfer_syntax_uid: impl Into<String>, codec: Box<dyn FrameCodec>) {
        self.codecs.insert(transfer_syntax_uid.into(), codec);
    }

    pub fn supports(&self, transfer_syntax_uid: &str) -> bool {
        self.codecs.contains_key(transfer_syntax_uid)
    }

    pub(crate) fn get(&self, transfer_syntax_uid: &str) -> Result<&dyn FrameCodec> {
        self.codecs
            .get(transfer_syntax_uid)
            .map(|c| c.as_ref())
            .ok_or_else(|| {
                SegmentationError::Configuration(format!(
                    "no frame codec registered for transfer syntax {transfer_syntax_uid}"
                ))
            })
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("transfer_syntaxes", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Pack one bit per value, first value in the least significant bit of
/// the first byte. The input spans all frames so that packing crosses
/// frame boundaries when the pixel count per frame is not a multiple
/// of eight.
pub(crate) fn pack_bits(values: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(8)];
    for (i, &v) in values.iter().enumerate() {
        if v != 0 {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `count` bits starting at an arbitrary bit offset.
pub(crate) fn unpack_bits(bytes: &[u8], bit_offset: usize, count: usize) -> Result<Vec<u8>> {
    let end = bit_offset + count;
    if end.div_ceil(8) > bytes.len() {
        return Err(SegmentationError::Integrity(format!(
            "pixel data too short: need {} bits, have {}",
            end,
            bytes.len() * 8
        )));
    }
    let mut out = Vec::with_capacity(count);
    for i in bit_offset..end {
        out.push((bytes[i / 8] >> (i % 8)) & 1);
    }
    Ok(out)
}

/// Serialize a label-map plane at 8 or 16 bits per pixel, little endian.
pub(crate) fn labelmap_bytes(plane: &Array2<u16>, bits_allocated: u16) -> Vec<u8> {
    match bits_allocated {
        8 => plane.iter().map(|&v| v as u8).collect(),
        _ => plane.iter().flat_map(|&v| v.to_le_bytes()).collect(),
    }
}

/// The pixel payload of a finished segmentation object.
#[derive(Debug, Clone)]
pub(crate) enum StoredFrames {
    /// Uncompressed pixel data; binary frames are packed across frame
    /// boundaries.
    Native { data: Vec<u8>, bits_allocated: u16 },
    /// One compressed fragment per frame.
    Encapsulated {
        fragments: Vec<Vec<u8>>,
        transfer_syntax_uid: String,
    },
}

impl StoredFrames {
    /// Decode a single stored frame into an 8-bit plane, leaving all
    /// other frames untouched.
    pub(crate) fn plane(
        &self,
        index: usize,
        ctx: &FrameContext,
        codecs: &CodecRegistry,
    ) -> Result<Array2<u8>> {
        let rows = ctx.rows as usize;
        let columns = ctx.columns as usize;
        let pixels = rows * columns;
        let values = match self {
            StoredFrames::Native {
                data,
                bits_allocated: 1,
            } => unpack_bits(data, index * pixels, pixels)?,
            StoredFrames::Native {
                data,
                bits_allocated: 8,
            } => {
                let start = index * pixels;
                let end = start + pixels;
                if end > data.len() {
                    return Err(SegmentationError::Integrity(format!(
                        "pixel data too short for frame {index}"
                    )));
                }
                data[start..end].to_vec()
            }
            StoredFrames::Native { bits_allocated, .. } => {
                return Err(SegmentationError::NotIndexable(format!(
                    "frames with {bits_allocated} bits per pixel cannot be read per segment"
                )));
            }
            StoredFrames::Encapsulated {
                fragments,
                transfer_syntax_uid,
            } => {
                let fragment = fragments.get(index).ok_or_else(|| {
                    SegmentationError::Integrity(format!(
                        "pixel data holds no fragment for frame {index}"
                    ))
                })?;
                let decoded = codecs.get(transfer_syntax_uid)?.decode(fragment, ctx)?;
                if decoded.len() != pixels {
                    return Err(SegmentationError::Integrity(format!(
                        "decoded frame {index} has {} pixels, expected {pixels}",
                        decoded.len()
                    )));
                }
                decoded
            }
        };
        Array2::from_shape_vec((rows, columns), values)
            .map_err(|e| SegmentationError::Integrity(format!("bad frame shape: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_bits_lsb_first() {
        assert_eq!(pack_bits(&[1, 0, 0, 0, 0, 0, 0, 0, 1]), vec![0b0000_0001, 0b0000_0001]);
        assert_eq!(pack_bits(&[0, 1, 1]), vec![0b0000_0110]);
    }

    #[test]
    fn unpack_at_unaligned_offsets() {
        // Two 3-pixel frames packed back to back: frame 0 = 101, frame 1 = 011.
        let packed = pack_bits(&[1, 0, 1, 0, 1, 1]);
        assert_eq!(unpack_bits(&packed, 0, 3).unwrap(), vec![1, 0, 1]);
        assert_eq!(unpack_bits(&packed, 3, 3).unwrap(), vec![0, 1, 1]);
    }

    #[test]
    fn unpack_past_end_fails() {
        let packed = pack_bits(&[1, 1, 1]);
        assert!(unpack_bits(&packed, 4, 8).is_err());
    }

    #[test]
    fn pack_unpack_round_trip_many_sizes() {
        for len in [1usize, 7, 8, 9, 63, 64, 65] {
            let values: Vec<u8> = (0..len).map(|i| (i % 3 == 0) as u8).collect();
            let packed = pack_bits(&values);
            assert_eq!(unpack_bits(&packed, 0, len).unwrap(), values);
        }
    }

    #[test]
    fn native_binary_frame_access() {
        // 3 frames of 2x3 pixels, only frame 1 set.
        let mut values = vec![0u8; 18];
        for v in &mut values[6..12] {
            *v = 1;
        }
        let store = StoredFrames::Native {
            data: pack_bits(&values),
            bits_allocated: 1,
        };
        let ctx = FrameContext {
            rows: 2,
            columns: 3,
            bits_allocated: 1,
            bits_stored: 1,
            photometric_interpretation: "MONOCHROME2".into(),
            pixel_representation: 0,
            samples_per_pixel: 1,
        };
        let codecs = CodecRegistry::default();
        assert!(store.plane(0, &ctx, &codecs).unwrap().iter().all(|&v| v == 0));
        assert!(store.plane(1, &ctx, &codecs).unwrap().iter().all(|&v| v == 1));
        assert!(store.plane(2, &ctx, &codecs).unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn labelmap_bytes_widths() {
        let plane = Array2::from_shape_vec((1, 2), vec![1u16, 258]).unwrap();
        assert_eq!(labelmap_bytes(&plane, 16), vec![1, 0, 2, 1]);
        let plane = Array2::from_shape_vec((1, 2), vec![3u16, 4]).unwrap();
        assert_eq!(labelmap_bytes(&plane, 8), vec![3, 4]);
    }
}
