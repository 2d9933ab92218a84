//! Existence probes against the image origin.
//!
//! The cache only needs to know whether an image exists. How that is determined is
//! behind the [`ProbeExists`] trait, with [`HttpProber`] as the implementation that
//! talks to the real origin.

use std::sync::Arc;

use futures::future::BoxFuture;
use url::Url;

use crate::error::ProbeResult;

mod guard;
mod http;

pub use guard::OriginGuard;
pub use http::{HttpProber, ProbeTimeouts, USER_AGENT, create_client};

/// Answers whether an image object exists at a URL.
///
/// Implementations issue a single request per call; de-duplication and
/// memoization are done by the [`ImageCache`](crate::cache::ImageCache).
pub trait ProbeExists: Send + Sync + 'static {
    /// Checks whether the image at `url` can be loaded.
    ///
    /// Returns `Ok(())` if it exists, [`ProbeError::NotFound`](crate::error::ProbeError::NotFound)
    /// if the origin confirmed it does not, and other errors for failures that say nothing
    /// about the image itself.
    fn probe_exists<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, ProbeResult>;
}

impl<T: ProbeExists + ?Sized> ProbeExists for Arc<T> {
    fn probe_exists<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, ProbeResult> {
        (**self).probe_exists(url)
    }
}
