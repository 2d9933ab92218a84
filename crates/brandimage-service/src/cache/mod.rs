//! The shared product image cache.
//!
//! Every product surface asks the same [`ImageCache`] for images. It probes the origin
//! at most once per base image, fans the outcome out to everyone who asked in the
//! meantime, and remembers it for later callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use sentry::{Hub, SentryFutureExt};
use url::Url;

use crate::brand::{BrandAliases, CanonicalBrand};
use crate::config::Config;
use crate::error::{ImageUnavailable, ProbeError, ProbeResult, Resolution, ResolvedImage};
use crate::key::ImageKey;
use crate::probe::{HttpProber, OriginGuard, ProbeExists};
use crate::utils::defer;
use crate::variant::SizeVariant;


/// The outcome of one probe, as it is stored and fanned out.
#[derive(Clone, Debug)]
struct ProbedImage {
    /// The URL of the base image, the one that was found if any.
    base_url: Url,
    result: ProbeResult,
}

impl ProbedImage {
    fn into_resolution(self, variant: SizeVariant) -> Resolution {
        match self.result {
            Ok(()) => Ok(ResolvedImage {
                url: variant.apply(&self.base_url),
                variant,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

type SharedProbe = Shared<BoxFuture<'static, ProbedImage>>;

/// A probe that is currently running.
struct InFlight {
    /// Tells apart a probe from one started after its key was invalidated.
    generation: u64,
    probe: SharedProbe,
    waiters: Arc<AtomicUsize>,
}

/// The state of one product image in the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionState {
    /// Nothing is known about the image.
    Unresolved,
    /// A probe is running, `waiters` callers are waiting for it.
    Pending { waiters: usize },
    /// The image exists at `url`.
    Resolved { url: Url },
    /// The origin confirmed there is no image.
    Missing,
    /// The last probe failed for reasons unrelated to the image.
    ///
    /// Only kept if `retry_transient_after` is configured.
    Unreachable { error: ProbeError },
}

/// A snapshot of the cache contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Images known to exist.
    pub resolved: u64,
    /// Images known to be missing.
    pub missing: u64,
    /// Remembered transient failures.
    pub unreachable: u64,
    /// Probes currently running.
    pub in_flight: usize,
}

/// Decides how long a stored probe outcome stays valid.
#[derive(Clone, Copy, Debug)]
struct ProbeExpiration {
    retry_hits_after: Option<Duration>,
    retry_misses_after: Option<Duration>,
    retry_transient_after: Option<Duration>,
}

impl ProbeExpiration {
    fn from_config(config: &Config) -> Self {
        Self {
            retry_hits_after: config.retry_hits_after,
            retry_misses_after: config.retry_misses_after,
            retry_transient_after: config.retry_transient_after,
        }
    }

    /// Whether an outcome is stored at all.
    fn is_cacheable(&self, result: &ProbeResult) -> bool {
        match result {
            Ok(()) => true,
            Err(ProbeError::InternalError) => false,
            Err(err) if err.is_transient() => self
                .retry_transient_after
                .is_some_and(|after| !after.is_zero()),
            Err(_) => true,
        }
    }

    /// The time to live of an outcome, `None` means it lives until evicted.
    fn time_to_live(&self, result: &ProbeResult) -> Option<Duration> {
        match result {
            Ok(()) => self.retry_hits_after,
            Err(err) if err.is_transient() => self.retry_transient_after,
            Err(_) => self.retry_misses_after,
        }
    }
}

impl moka::Expiry<ImageKey, ProbedImage> for ProbeExpiration {
    fn expire_after_create(
        &self,
        _key: &ImageKey,
        value: &ProbedImage,
        _current_time: Instant,
    ) -> Option<Duration> {
        self.time_to_live(&value.result)
    }

    fn expire_after_update(
        &self,
        _key: &ImageKey,
        value: &ProbedImage,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        self.time_to_live(&value.result)
    }
}

struct Inner {
    origin: Url,
    image_files: Vec<String>,
    aliases: BrandAliases,
    prober: Box<dyn ProbeExists>,
    guard: Option<OriginGuard>,
    probe_timeout: Duration,
    prefetch_concurrency: usize,
    expiration: ProbeExpiration,

    /// Finished probes, bounded in size.
    probed: moka::sync::Cache<ImageKey, ProbedImage>,

    /// Probes that are currently running.
    pending: Mutex<HashMap<ImageKey, InFlight>>,

    next_generation: AtomicU64,
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<ImageKey, InFlight>> {
        // The map stays consistent even if a holder panicked.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tries the image files of `key` in order and stops at the first one served.
    ///
    /// Confirmed misses move on to the next file. A transient failure ends the search,
    /// as the remaining files would most likely fail the same way.
    async fn probe(&self, key: &ImageKey) -> ProbedImage {
        let candidates = key.candidate_urls(&self.origin, &self.image_files);
        let mut result: ProbeResult = Err(ProbeError::NotFound);
        for url in &candidates {
            result = self.probe_url(url).await;
            match &result {
                Ok(()) => {
                    return ProbedImage {
                        base_url: url.clone(),
                        result,
                    };
                }
                Err(err) if err.is_transient() => break,
                Err(_) => {}
            }
        }

        ProbedImage {
            base_url: self.primary_url(key),
            result,
        }
    }

    /// The URL of the first image file of `key`, reported for failed probes.
    fn primary_url(&self, key: &ImageKey) -> Url {
        match self.image_files.first() {
            Some(pattern) => key.image_url(&self.origin, &key.file_name(pattern)),
            None => self.origin.clone(),
        }
    }

    /// Probes a single URL, applying the origin guard and the probe timeout.
    async fn probe_url(&self, url: &Url) -> ProbeResult {
        if let Some(guard) = &self.guard
            && let Err(err) = guard.check(url)
        {
            metric!(counter("images.probe") += 1, "status" => "blocked");
            return Err(err);
        }

        let start = Instant::now();
        let probe = self.prober.probe_exists(url);
        let result = match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.probe_timeout)),
        };

        let status = match &result {
            Ok(()) => "found",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("images.probe") += 1, "status" => status);
        metric!(timer("images.probe.duration") = start.elapsed(), "status" => status);
        tracing::debug!(%url, status, "Probed image");

        if let (Some(guard), Err(err)) = (&self.guard, &result) {
            guard.register_failure(url, err);
        }

        result
    }

    /// Stores the outcome of a probe and clears its pending marker.
    ///
    /// Does nothing if the key was invalidated since the probe was started.
    fn complete(&self, key: &ImageKey, generation: u64, outcome: &ProbedImage) {
        let mut pending = self.lock_pending();
        if !pending
            .get(key)
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            return;
        }
        if self.expiration.is_cacheable(&outcome.result) {
            self.probed.insert(key.clone(), outcome.clone());
        }
        pending.remove(key);
    }

    /// Removes the pending marker of a probe without storing anything.
    fn abandon(&self, key: &ImageKey, generation: u64) {
        let mut pending = self.lock_pending();
        if pending
            .get(key)
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            pending.remove(key);
        }
    }
}

/// Resolves products to displayable image URLs.
///
/// The cache is cheap to clone; all clones share the same state. Create one when the
/// application starts and hand it to everything that shows product images.
///
/// Internally de-duplicates concurrent lookups: at most one probe per base image is
/// running at any time, no matter how many callers or size variants are involved.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .inner
            .pending
            .try_lock()
            .map(|p| p.len())
            .unwrap_or_default();
        f.debug_struct("ImageCache")
            .field("origin", &self.inner.origin.as_str())
            .field("in-memory items", &self.inner.probed.entry_count())
            .field("running probes", &in_flight)
            .finish()
    }
}

impl ImageCache {
    /// Creates a cache that uses `prober` to check for images.
    pub fn new(config: &Config, prober: impl ProbeExists) -> Self {
        let expiration = ProbeExpiration::from_config(config);
        let probed = moka::sync::Cache::builder()
            .name("brand-images")
            .max_capacity(config.capacity)
            .expire_after(expiration)
            .build();

        let inner = Inner {
            origin: config.origin.clone(),
            image_files: config.image_files.clone(),
            aliases: BrandAliases::with_extra(&config.brand_aliases),
            prober: Box::new(prober),
            guard: OriginGuard::from_config(config),
            probe_timeout: config.probe_timeout,
            prefetch_concurrency: config.prefetch_concurrency.max(1),
            expiration,
            probed,
            pending: Default::default(),
            next_generation: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a cache that probes the configured HTTP origin.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let prober = HttpProber::from_config(config).context("failed to create HTTP client")?;
        Ok(Self::new(config, prober))
    }

    /// The origin images are resolved against.
    pub fn origin(&self) -> &Url {
        &self.inner.origin
    }

    /// Maps a raw brand name to the folder its images live in.
    pub fn canonicalize(&self, brand: &str) -> Option<CanonicalBrand> {
        self.inner.aliases.canonicalize(brand)
    }

    fn key(&self, brand: &str, sku: &str) -> Result<ImageKey, ImageUnavailable> {
        let brand = self.canonicalize(brand).ok_or(ImageUnavailable::NoBrand)?;
        if sku.trim().is_empty() {
            return Err(ImageUnavailable::NoSku);
        }
        Ok(ImageKey::new(brand, sku))
    }

    /// Resolves the image of a product in the requested size.
    ///
    /// Products without a brand or SKU fail right away without touching the network.
    /// Otherwise the origin is probed only if nothing is known about the image yet and
    /// no other probe for it is running.
    ///
    /// Dropping the returned future does not cancel the probe; its outcome is still
    /// stored for the next caller.
    pub async fn resolve(&self, brand: &str, sku: &str, variant: SizeVariant) -> Resolution {
        let key = self.key(brand, sku)?;
        metric!(counter("images.access") += 1, "variant" => variant.as_str());

        self.probe_memoized(&key).await.into_resolution(variant)
    }

    /// Returns the stored outcome for `key`, or waits for a (possibly new) probe.
    async fn probe_memoized(&self, key: &ImageKey) -> ProbedImage {
        if let Some(probed) = self.inner.probed.get(key) {
            metric!(counter("images.memory.hit") += 1);
            tracing::trace!(%key, "Image found in memory");
            return probed;
        }

        let (probe, waiters) = {
            let mut pending = self.inner.lock_pending();
            // A probe might have finished between the lookup above and taking the lock.
            if let Some(probed) = self.inner.probed.get(key) {
                metric!(counter("images.memory.hit") += 1);
                return probed;
            }
            match pending.get(key) {
                Some(in_flight) => {
                    metric!(counter("images.probe.coalesced") += 1);
                    (in_flight.probe.clone(), Arc::clone(&in_flight.waiters))
                }
                None => {
                    let in_flight = self.spawn_probe(key.clone());
                    let handles = (in_flight.probe.clone(), Arc::clone(&in_flight.waiters));
                    pending.insert(key.clone(), in_flight);
                    handles
                }
            }
        };

        waiters.fetch_add(1, Ordering::Relaxed);
        let _waiting = defer(|| {
            waiters.fetch_sub(1, Ordering::Relaxed);
        });

        probe.await
    }

    /// Spawns the probe for `key` as its own task.
    ///
    /// The task outlives every caller, so a caller losing interest never aborts a probe
    /// that others may still be waiting for.
    fn spawn_probe(&self, key: ImageKey) -> InFlight {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%key, generation, "Spawning image probe");

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = async move {
            let key = task_key;
            // Clears the pending marker even if the probe panics.
            let _abandon = {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                defer(move || inner.abandon(&key, generation))
            };

            let outcome = inner.probe(&key).await;
            inner.complete(&key, generation, &outcome);
            outcome
        };
        let handle = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        let base_url = self.inner.primary_url(&key);
        let probe = handle
            .map(move |joined| match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        url = %base_url,
                        "Image probe task failed"
                    );
                    ProbedImage {
                        base_url,
                        result: Err(ProbeError::InternalError),
                    }
                }
            })
            .boxed()
            .shared();

        InFlight {
            generation,
            probe,
            waiters: Default::default(),
        }
    }

    /// Resolves many products at once, keeping a bounded number of probes in flight.
    ///
    /// The outcomes are returned in the order of `products`.
    pub async fn prefetch<I, B, S>(&self, products: I, variant: SizeVariant) -> Vec<Resolution>
    where
        I: IntoIterator<Item = (B, S)>,
        B: AsRef<str>,
        S: AsRef<str>,
    {
        let lookups = products.into_iter().map(|(brand, sku)| async move {
            self.resolve(brand.as_ref(), sku.as_ref(), variant).await
        });
        futures::stream::iter(lookups)
            .buffered(self.inner.prefetch_concurrency)
            .collect()
            .await
    }

    /// Forgets what is known about matching images, so the next lookup probes again.
    ///
    /// Without arguments, everything is forgotten. With only a brand, all SKUs of that
    /// brand are forgotten, with only a SKU that SKU under every brand.
    ///
    /// Running probes for matching images still answer the callers already waiting for
    /// them, but their outcome is not stored.
    pub fn invalidate(&self, brand: Option<&str>, sku: Option<&str>) {
        let brand = match brand {
            Some(raw) => match self.canonicalize(raw) {
                Some(brand) => Some(brand),
                // There is nothing stored for products without a brand.
                None => return,
            },
            None => None,
        };
        let sku = sku.map(str::trim);

        let mut pending = self.inner.lock_pending();
        if brand.is_none() && sku.is_none() {
            tracing::debug!("Clearing image cache");
            self.inner.probed.invalidate_all();
            pending.clear();
            return;
        }

        let matches = |key: &ImageKey| {
            brand.as_ref().is_none_or(|brand| key.brand() == brand)
                && sku.is_none_or(|sku| key.sku() == sku)
        };

        let stale: Vec<_> = self
            .inner
            .probed
            .iter()
            .filter(|(key, _)| matches(&**key))
            .map(|(key, _)| key)
            .collect();
        tracing::debug!(entries = stale.len(), "Invalidating images");
        for key in stale {
            self.inner.probed.invalidate(&*key);
        }
        pending.retain(|key, _| !matches(key));
    }

    /// Forgets everything. Same as `invalidate(None, None)`.
    pub fn clear(&self) {
        self.invalidate(None, None);
    }

    /// Returns what is currently known about a product image, without probing.
    pub fn state(&self, brand: &str, sku: &str) -> ResolutionState {
        let Ok(key) = self.key(brand, sku) else {
            return ResolutionState::Unresolved;
        };

        if let Some(in_flight) = self.inner.lock_pending().get(&key) {
            return ResolutionState::Pending {
                waiters: in_flight.waiters.load(Ordering::Relaxed),
            };
        }

        match self.inner.probed.get(&key) {
            None => ResolutionState::Unresolved,
            Some(ProbedImage {
                base_url,
                result: Ok(()),
            }) => ResolutionState::Resolved { url: base_url },
            Some(ProbedImage { result: Err(err), .. }) if err.is_transient() => {
                ResolutionState::Unreachable { error: err }
            }
            Some(_) => ResolutionState::Missing,
        }
    }

    /// Counts what the cache currently holds.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            in_flight: self.inner.lock_pending().len(),
            ..Default::default()
        };
        for (_, probed) in self.inner.probed.iter() {
            match probed.result {
                Ok(()) => stats.resolved += 1,
                Err(err) if err.is_transient() => stats.unreachable += 1,
                Err(_) => stats.missing += 1,
            }
        }
        stats
    }
}
