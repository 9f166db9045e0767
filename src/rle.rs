//! DICOM RLE Lossless (PS3.5 annex G) frame codec.
//!
//! A frame is split into byte segments (most significant byte first),
//! each PackBits-compressed, preceded by a 64-byte header of
//! little-endian offsets. Supports single-sample frames of 8 or 16 bits,
//! which covers fractional and label-map segmentation frames.

use crate::error::{Result, SegmentationError};
use crate::frame::{FrameCodec, FrameContext};

const HEADER_LEN: usize = 64;
const MAX_SEGMENTS: usize = 15;

pub struct RleLosslessCodec;

impl FrameCodec for RleLosslessCodec {
    fn encode(&self, frame: &[u8], ctx: &FrameContext) -> Result<Vec<u8>> {
        encode_frame(frame, ctx)
    }

    fn decode(&self, encoded: &[u8], ctx: &FrameContext) -> Result<Vec<u8>> {
        decode_frame(encoded, ctx)
    }
}

fn bytes_per_pixel(ctx: &FrameContext) -> Result<usize> {
    if ctx.bits_allocated % 8 != 0 || ctx.bits_allocated == 0 {
        return Err(SegmentationError::Configuration(format!(
            "RLE requires a whole number of bytes per pixel, got {} bits",
            ctx.bits_allocated
        )));
    }
    let bytes = usize::from(ctx.bits_allocated / 8) * usize::from(ctx.samples_per_pixel);
    if bytes > MAX_SEGMENTS {
        return Err(SegmentationError::Configuration(
            "RLE supports at most 15 byte segments per frame".into(),
        ));
    }
    Ok(bytes)
}

/// Compress one native little-endian frame buffer.
pub fn encode_frame(frame: &[u8], ctx: &FrameContext) -> Result<Vec<u8>> {
    let bpp = bytes_per_pixel(ctx)?;
    let pixels = ctx.rows as usize * ctx.columns as usize;
    if frame.len() != pixels * bpp {
        return Err(SegmentationError::Configuration(format!(
            "frame buffer holds {} bytes, expected {}",
            frame.len(),
            pixels * bpp
        )));
    }

    let mut segments = Vec::with_capacity(bpp);
    for seg in 0..bpp {
        // Segment 0 carries the most significant byte of each pixel.
        let byte_index = bpp - 1 - seg;
        let plane: Vec<u8> = (0..pixels).map(|p| frame[p * bpp + byte_index]).collect();
        segments.push(encode_segment(&plane));
    }

    let mut out = vec![0u8; HEADER_LEN];
    out[..4].copy_from_slice(&(segments.len() as u32).to_le_bytes());
    let mut offset = HEADER_LEN as u32;
    for (i, segment) in segments.iter().enumerate() {
        let slot = 4 + i * 4;
        out[slot..slot + 4].copy_from_slice(&offset.to_le_bytes());
        offset += segment.len() as u32;
    }
    for segment in &segments {
        out.extend_from_slice(segment);
    }
    Ok(out)
}

/// Decompress one frame back into its native little-endian buffer.
pub fn decode_frame(encoded: &[u8], ctx: &FrameContext) -> Result<Vec<u8>> {
    let bpp = bytes_per_pixel(ctx)?;
    let pixels = ctx.rows as usize * ctx.columns as usize;
    if encoded.len() < HEADER_LEN {
        return Err(SegmentationError::Integrity(
            "RLE frame shorter than its 64-byte header".into(),
        ));
    }

    let mut offsets = Vec::with_capacity(MAX_SEGMENTS);
    for i in 0..MAX_SEGMENTS {
        let slot = 4 + i * 4;
        let offset = u32::from_le_bytes([
            encoded[slot],
            encoded[slot + 1],
            encoded[slot + 2],
            encoded[slot + 3],
        ]);
        if offset != 0 {
            offsets.push(offset as usize);
        }
    }
    if offsets.len() != bpp || offsets.first() != Some(&HEADER_LEN) {
        return Err(SegmentationError::Integrity(format!(
            "RLE header describes {} segments, expected {bpp}",
            offsets.len()
        )));
    }
    offsets.push(encoded.len());
    if offsets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(SegmentationError::Integrity(
            "RLE segment offsets are not strictly increasing".into(),
        ));
    }

    let mut out = vec![0u8; pixels * bpp];
    for seg in 0..bpp {
        let plane = decode_segment(&encoded[offsets[seg]..offsets[seg + 1]], pixels)?;
        let byte_index = bpp - 1 - seg;
        for (p, value) in plane.into_iter().enumerate() {
            out[p * bpp + byte_index] = value;
        }
    }
    Ok(out)
}

/// PackBits-compress one byte segment, padded to even length.
fn encode_segment(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if i + 1 < data.len() && data[i + 1] == data[i] {
            // Replicate run.
            let mut run = 2;
            while i + run < data.len() && data[i + run] == data[i] && run < 128 {
                run += 1;
            }
            out.push((257 - run) as u8);
            out.push(data[i]);
            i += run;
        } else {
            // Literal run, broken by the next repeat.
            let start = i;
            i += 1;
            while i < data.len()
                && i - start < 128
                && !(i + 1 < data.len() && data[i + 1] == data[i])
            {
                i += 1;
            }
            out.push((i - start - 1) as u8);
            out.extend_from_slice(&data[start..i]);
        }
    }
    if out.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn decode_segment(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while i < data.len() && out.len() < expected {
        let header = data[i] as i8;
        i += 1;
        if header >= 0 {
            let n = header as usize + 1;
            if i + n > data.len() {
                return Err(SegmentationError::Integrity(
                    "RLE literal run truncated".into(),
                ));
            }
            out.extend_from_slice(&data[i..i + n]);
            i += n;
        } else if header != -128 {
            let n = 1 - header as isize;
            let Some(&value) = data.get(i) else {
                return Err(SegmentationError::Integrity(
                    "RLE replicate run truncated".into(),
                ));
            };
            out.extend(std::iter::repeat(value).take(n as usize));
            i += 1;
        }
    }
    if out.len() != expected {
        return Err(SegmentationError::Integrity(format!(
            "RLE segment decoded to {} bytes, expected {expected}",
            out.len()
        )));
    }
    Ok(out)
}
