use thiserror::Error;

/// Errors raised while building or querying a segmentation object.
///
/// The first four variants form the failure taxonomy of this crate:
/// bad caller input, a stored object contradicting itself, a query mode
/// that is structurally impossible for the object at hand, and a
/// requested key that does not exist. The remaining variants wrap
/// failures bubbling up from the underlying DICOM library.
#[derive(Debug, Error)]
pub enum SegmentationError {
    /// The caller-supplied shape, type or value combination is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A previously encoded object is internally inconsistent.
    #[error("segmentation object integrity violated: {0}")]
    Integrity(String),

    /// The requested query mode is impossible for this object.
    #[error("frames are not indexable this way: {0}")]
    NotIndexable(String),

    /// A requested key does not exist in the object.
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM read error: {0}")]
    Read(#[from] dicom::object::ReadError),

    #[error("DICOM write error: {0}")]
    Write(#[from] dicom::object::WriteError),

    #[error("DICOM attribute error: {0}")]
    Access(#[from] dicom::object::AccessError),

    #[error("DICOM value error: {0}")]
    Value(#[from] dicom::core::value::ConvertValueError),
}

pub type Result<T> = std::result::Result<T, SegmentationError>;
