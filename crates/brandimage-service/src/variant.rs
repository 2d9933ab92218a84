use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// A named size/quality transformation requested from the image origin.
///
/// All variants of one product image share the same base image, so they are
/// derived from a single existence probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeVariant {
    /// 200x200, used by grid cards and cart lines.
    Thumbnail,
    /// 400x400, used by list rows and the catalogue builder.
    #[default]
    Medium,
    /// 800x800, used by the quick view.
    Large,
    /// A tiny blurred placeholder shown while the real image loads.
    PreviewBlurred,
}

impl SizeVariant {
    /// All known variants.
    pub const ALL: [SizeVariant; 4] = [
        SizeVariant::Thumbnail,
        SizeVariant::Medium,
        SizeVariant::Large,
        SizeVariant::PreviewBlurred,
    ];

    /// The name used in configuration files and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            SizeVariant::Thumbnail => "thumbnail",
            SizeVariant::Medium => "medium",
            SizeVariant::Large => "large",
            SizeVariant::PreviewBlurred => "preview-blurred",
        }
    }

    /// The transformation segment the origin understands for this variant.
    pub fn transformation(self) -> &'static str {
        match self {
            SizeVariant::Thumbnail => "tr:w-200,h-200,c-maintain_ratio,q-80,f-auto",
            SizeVariant::Medium => "tr:w-400,h-400,c-maintain_ratio,q-85,f-auto",
            SizeVariant::Large => "tr:w-800,h-800,c-maintain_ratio,q-90,f-auto",
            SizeVariant::PreviewBlurred => "tr:w-100,h-100,c-maintain_ratio,q-60,f-auto,bl-10",
        }
    }

    /// Derives the URL of this variant from the base image URL.
    pub fn apply(self, base: &Url) -> Url {
        let mut url = base.clone();
        // Base image URLs are always built from an http(s) origin, which can be a base.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(self.transformation());
        }
        url
    }
}

impl fmt::Display for SizeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`SizeVariant`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown image variant `{0}`")]
pub struct ParseVariantError(String);

impl FromStr for SizeVariant {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thumbnail" => Ok(SizeVariant::Thumbnail),
            "medium" => Ok(SizeVariant::Medium),
            "large" => Ok(SizeVariant::Large),
            "preview-blurred" | "preview" => Ok(SizeVariant::PreviewBlurred),
            _ => Err(ParseVariantError(s.to_owned())),
        }
    }
}
