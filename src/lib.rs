//! # DICOM-seg library
//!
//! This crate creates and queries DICOM Segmentation (SEG) objects:
//! multi-frame datasets in which each frame stores a binary or
//! fractional mask of one segment over a source radiology or pathology
//! image.
//!
//! This library is part of the dicom-rs ecosystem and leverages its
//! components for attribute storage, file reading and writing.
//! Segmentations can be encoded from 2-, 3- or 4-dimensional mask
//! arrays (label maps or stacked per-segment masks, binary or
//! fractional), and previously encoded objects can be opened and
//! queried frame by frame:
//!  - by source SOP instance
//!  - by source frame number
//!  - by dimension index values
//!
//! Queries reconstruct only the frames they need, either stacking the
//! requested segments along the last axis of the output array or
//! combining them into a label map. Uncompressed transfer syntaxes and
//! RLE Lossless are supported out of the box; other lossless codecs
//! plug in through [`CodecRegistry`].
//!
//! # Examples
//!
//! ## Encoding and querying a binary segmentation
//!
//! Encode a mask covering one CT slice, then reconstruct it from the
//! finished object.
//!
//! ```no_run
//! # use dicom_seg::{
//! #     CodedConcept, MaskOptions, PixelArray, SegmentAlgorithmType, SegmentDescription,
//! #     SegmentationBuilder, SegmentationType,
//! # };
//! # use dicom::object::open_file;
//! # use ndarray::{Array2, ArrayD};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ct = open_file("slice.dcm")?;
//! let mut mask = Array2::<u8>::zeros((512, 512));
//! mask[[256, 256]] = 1;
//!
//! let description = SegmentDescription::new(
//!     1,
//!     "tumor",
//!     CodedConcept::new("49755003", "SCT", "Morphologically Altered Structure"),
//!     CodedConcept::new("108369006", "SCT", "Tumor"),
//!     SegmentAlgorithmType::Manual,
//! )?;
//! let seg = SegmentationBuilder::new(
//!     "1.2.826.0.1.3680043.8.498.1",
//!     1,
//!     "1.2.826.0.1.3680043.8.498.2",
//!     1,
//!     "Example Manufacturer",
//!     "example-seg",
//!     "0.1.0",
//!     "0000",
//! )
//! .build(
//!     &[ct.into_inner()],
//!     PixelArray::from(mask.into_dyn()),
//!     SegmentationType::Binary,
//!     vec![description],
//! )?;
//!
//! let (_, _, sop_uid) = seg.get_source_image_uids()[0].clone();
//! let pixels: ArrayD<u8> =
//!     seg.get_pixels_by_source_instance(&[sop_uid.as_str()], &MaskOptions::new())?;
//! assert_eq!(pixels.shape(), &[1, 512, 512, 1]);
//! # Ok(())
//! # }
//! ```

pub mod coding;
pub mod content;
pub mod enums;
pub mod error;
mod attrs;
mod frame;
mod index;
mod pixels;
mod reconstruct;
pub mod rle;
pub mod segmentation;
mod source;
pub mod spatial;

pub use coding::CodedConcept;
pub use content::{PixelMeasures, PlaneOrientation, PlanePosition, SegmentDescription};
pub use enums::{
    CoordinateSystem, FractionalType, SegmentAlgorithmType, SegmentationType, SegmentsOverlap,
    SpatialLocationsPreserved,
};
pub use error::{Result, SegmentationError};
pub use frame::{CodecRegistry, FrameCodec, FrameContext};
pub use pixels::PixelArray;
pub use reconstruct::MaskPixel;
pub use segmentation::{
    MaskOptions, SegmentCriteria, Segmentation, SegmentationBuilder, segread, segread_from,
};
