//! Coded concepts attached to segment descriptions and derivation
//! references.

use dicom::core::VR;
use dicom_dictionary_std::tags;

use crate::attrs::{self, Item};
use crate::error::{Result, SegmentationError};

/// A coded concept from a controlled vocabulary.
///
/// Two concepts are considered equal when their code value and coding
/// scheme designator match; the human-readable meaning carries no
/// identity.
#[derive(Debug, Clone)]
pub struct CodedConcept {
    value: String,
    scheme_designator: String,
    meaning: String,
    scheme_version: Option<String>,
}

impl CodedConcept {
    pub fn new(
        value: impl Into<String>,
        scheme_designator: impl Into<String>,
        meaning: impl Into<String>,
    ) -> Self {
        Self {
            value: value.into(),
            scheme_designator: scheme_designator.into(),
            meaning: meaning.into(),
            scheme_version: None,
        }
    }

    pub fn with_scheme_version(mut self, version: impl Into<String>) -> Self {
        self.scheme_version = Some(version.into());
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn scheme_designator(&self) -> &str {
        &self.scheme_designator
    }

    pub fn meaning(&self) -> &str {
        &self.meaning
    }

    pub fn scheme_version(&self) -> Option<&str> {
        self.scheme_version.as_deref()
    }

    pub(crate) fn to_item(&self) -> Item {
        let mut item = Item::new_empty();
        attrs::put_str(&mut item, tags::CODE_VALUE, VR::SH, &*self.value);
        attrs::put_str(
            &mut item,
            tags::CODING_SCHEME_DESIGNATOR,
            VR::SH,
            &*self.scheme_designator,
        );
        attrs::put_str(&mut item, tags::CODE_MEANING, VR::LO, &*self.meaning);
        if let Some(version) = &self.scheme_version {
            attrs::put_str(&mut item, tags::CODING_SCHEME_VERSION, VR::SH, &**version);
        }
        item
    }

    pub(crate) fn from_item(item: &Item) -> Result<Self> {
        let value = attrs::string(item, tags::CODE_VALUE)
            .ok_or_else(|| SegmentationError::Integrity("code item lacks CodeValue".into()))?;
        let scheme_designator = attrs::string(item, tags::CODING_SCHEME_DESIGNATOR)
            .ok_or_else(|| {
                SegmentationError::Integrity("code item lacks CodingSchemeDesignator".into())
            })?;
        let meaning = attrs::string(item, tags::CODE_MEANING).unwrap_or_default();
        Ok(Self {
            value,
            scheme_designator,
            meaning,
            scheme_version: attrs::string(item, tags::CODING_SCHEME_VERSION),
        })
    }
}

impl PartialEq for CodedConcept {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.scheme_designator == other.scheme_designator
    }
}

/// Derivation code stamped on every derived frame: DCM 113076.
pub(crate) fn segmentation_derivation() -> CodedConcept {
    CodedConcept::new("113076", "DCM", "Segmentation")
}

/// Purpose-of-reference code for contributing source images: DCM 121322.
pub(crate) fn source_image_purpose() -> CodedConcept {
    CodedConcept::new(
        "121322",
        "DCM",
        "Source image for image processing operation",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_meaning() {
        let a = CodedConcept::new("49755003", "SCT", "Tumor");
        let b = CodedConcept::new("49755003", "SCT", "Neoplasm");
        let c = CodedConcept::new("49755003", "DCM", "Tumor");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn item_round_trip() {
        let code = CodedConcept::new("85756007", "SCT", "Tissue");
        let parsed = CodedConcept::from_item(&code.to_item()).unwrap();
        assert_eq!(code, parsed);
        assert_eq!(parsed.meaning(), "Tissue");
    }
}
