use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::variant::SizeVariant;

/// An error that happens when probing the image origin.
///
/// Probe errors are cloned to every caller waiting on the same probe and may be
/// kept in the cache, except for [`InternalError`](Self::InternalError).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The origin confirmed that there is no such image.
    #[error("not found")]
    NotFound,
    /// The origin refused to serve the image.
    ///
    /// The attached string contains the origin's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The probe did not finish in time.
    #[error("probe timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The origin could not be reached or answered with a server error.
    ///
    /// The attached string contains the details.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// An unexpected error while running the probe, like a panicking probe task.
    #[error("internal error")]
    InternalError,
}

impl ProbeError {
    /// Whether the origin gave a definitive answer that the image is unavailable.
    ///
    /// Transient errors say nothing about the image itself.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProbeError::NotFound | ProbeError::PermissionDenied(_))
    }

    /// A short name used for metrics tags.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            ProbeError::NotFound => "notfound",
            ProbeError::PermissionDenied(_) => "permissiondenied",
            ProbeError::Timeout(_) => "timeout",
            ProbeError::DownloadError(_) => "downloaderror",
            ProbeError::InternalError => "internalerror",
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            tracing::error!(error = &err as &dyn std::error::Error, "invalid probe request");
            return ProbeError::InternalError;
        }
        ProbeError::DownloadError(err.to_string())
    }
}

/// The outcome of a single probe.
pub type ProbeResult = Result<(), ProbeError>;

/// Why no image URL can be shown for a product.
///
/// All of these are expected outcomes: many products simply have no photography.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageUnavailable {
    /// The product has no brand, so there is no folder to look in.
    #[error("product has no brand")]
    NoBrand,
    /// The product has no SKU.
    #[error("product has no sku")]
    NoSku,
    /// The origin has no image for this product.
    #[error("no image found")]
    NotFound,
    /// The origin could not be asked right now.
    #[error("image origin unreachable: {0}")]
    Unreachable(#[source] ProbeError),
}

impl ImageUnavailable {
    /// The reason reported to UI callers.
    pub fn reason(&self) -> &'static str {
        match self {
            ImageUnavailable::NoBrand => "no-brand",
            ImageUnavailable::NoSku => "no-sku",
            ImageUnavailable::NotFound => "not-found",
            ImageUnavailable::Unreachable(_) => "unreachable",
        }
    }
}

impl From<ProbeError> for ImageUnavailable {
    fn from(err: ProbeError) -> Self {
        if err.is_transient() {
            ImageUnavailable::Unreachable(err)
        } else {
            ImageUnavailable::NotFound
        }
    }
}

/// A displayable product image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    /// The URL of the requested variant.
    pub url: Url,
    /// The variant that was requested.
    pub variant: SizeVariant,
}

/// The outcome of resolving a product image.
pub type Resolution = Result<ResolvedImage, ImageUnavailable>;

/// The serialized shape of a [`Resolution`] handed to UI callers.
///
/// This is `{"ok": true, "url": ...}` or `{"ok": false, "reason": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<&Resolution> for ResolutionReport {
    fn from(resolution: &Resolution) -> Self {
        match resolution {
            Ok(image) => ResolutionReport {
                ok: true,
                url: Some(image.url.clone()),
                reason: None,
            },
            Err(err) => ResolutionReport {
                ok: false,
                url: None,
                reason: Some(err.reason()),
            },
        }
    }
}
