//! Enumerated values used by the Segmentation IOD, with their DICOM
//! code-string representations.

use crate::error::{Result, SegmentationError};

/// How segment membership is encoded in the stored frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationType {
    /// One bit per pixel, one frame per segment and plane.
    Binary,
    /// Scaled integer probability or occupancy values.
    Fractional,
    /// Pixel value equals segment number.
    LabelMap,
}

impl SegmentationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentationType::Binary => "BINARY",
            SegmentationType::Fractional => "FRACTIONAL",
            SegmentationType::LabelMap => "LABELMAP",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "BINARY" => Ok(SegmentationType::Binary),
            "FRACTIONAL" => Ok(SegmentationType::Fractional),
            "LABELMAP" => Ok(SegmentationType::LabelMap),
            other => Err(SegmentationError::Configuration(format!(
                "unknown segmentation type {other:?}"
            ))),
        }
    }
}

/// Interpretation of fractional pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FractionalType {
    Probability,
    Occupancy,
}

impl FractionalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FractionalType::Probability => "PROBABILITY",
            FractionalType::Occupancy => "OCCUPANCY",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PROBABILITY" => Ok(FractionalType::Probability),
            "OCCUPANCY" => Ok(FractionalType::Occupancy),
            other => Err(SegmentationError::Configuration(format!(
                "unknown fractional type {other:?}"
            ))),
        }
    }
}

/// Whether any two segments of the object share a non-zero pixel.
///
/// A property of the whole segment set, decided once at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentsOverlap {
    Yes,
    Undefined,
    No,
}

impl SegmentsOverlap {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentsOverlap::Yes => "YES",
            SegmentsOverlap::Undefined => "UNDEFINED",
            SegmentsOverlap::No => "NO",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "YES" => Ok(SegmentsOverlap::Yes),
            "UNDEFINED" => Ok(SegmentsOverlap::Undefined),
            "NO" => Ok(SegmentsOverlap::No),
            other => Err(SegmentationError::Configuration(format!(
                "unknown segments overlap value {other:?}"
            ))),
        }
    }
}

/// Whether a derived frame's pixel grid aligns with its source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialLocationsPreserved {
    Yes,
    No,
}

impl SpatialLocationsPreserved {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpatialLocationsPreserved::Yes => "YES",
            SpatialLocationsPreserved::No => "NO",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "YES" => Ok(SpatialLocationsPreserved::Yes),
            "NO" => Ok(SpatialLocationsPreserved::No),
            other => Err(SegmentationError::Configuration(format!(
                "unknown spatial locations preserved value {other:?}"
            ))),
        }
    }
}

/// How a segment was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAlgorithmType {
    Automatic,
    SemiAutomatic,
    Manual,
}

impl SegmentAlgorithmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentAlgorithmType::Automatic => "AUTOMATIC",
            SegmentAlgorithmType::SemiAutomatic => "SEMIAUTOMATIC",
            SegmentAlgorithmType::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "AUTOMATIC" => Ok(SegmentAlgorithmType::Automatic),
            "SEMIAUTOMATIC" => Ok(SegmentAlgorithmType::SemiAutomatic),
            "MANUAL" => Ok(SegmentAlgorithmType::Manual),
            other => Err(SegmentationError::Configuration(format!(
                "unknown segment algorithm type {other:?}"
            ))),
        }
    }
}

/// Three-dimensional coordinate system the source images are positioned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSystem {
    Patient,
    Slide,
}
