use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use url::Url;

use crate::config::Config;
use crate::error::ProbeError;

/// A record of a number of probe failures in a given bucket.
#[derive(Debug, Clone, Copy)]
struct FailureCount {
    /// The start of the bucket, measured in milliseconds since the Unix Epoch.
    timestamp: u64,
    /// The number of failures.
    failures: usize,
}

type CountedFailures = Arc<Mutex<VecDeque<FailureCount>>>;

/// Keeps track of transient probe failures per origin host and stops probing
/// hosts that keep failing.
///
/// If a host has at least `failure_threshold` failures in a window of
/// `time_window_millis` ms, it is blocked for `block_time`. While a host is
/// blocked, probes against it fail right away, which keeps a product listing
/// from firing hundreds of doomed requests at an origin that is down.
///
/// Only transient failures count. A missing image is a perfectly healthy answer.
#[derive(Clone, Debug)]
pub struct OriginGuard {
    time_window_millis: u64,
    bucket_size_millis: u64,
    failure_threshold: usize,
    block_time: Duration,
    failures: moka::sync::Cache<String, CountedFailures>,
    blocked_hosts: moka::sync::Cache<String, ProbeError>,
}

impl OriginGuard {
    /// Creates a guard from the `origin_guard_*` settings, if it is enabled.
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.origin_guard_enabled {
            return None;
        }
        Some(Self::new(
            config.origin_guard_time_window,
            config.origin_guard_bucket_size,
            config.origin_guard_threshold,
            config.origin_guard_block_time,
        ))
    }

    pub fn new(
        time_window: Duration,
        bucket_size: Duration,
        failure_threshold: usize,
        block_time: Duration,
    ) -> Self {
        Self {
            time_window_millis: time_window.as_millis() as u64,
            bucket_size_millis: (bucket_size.as_millis() as u64).max(1),
            failure_threshold: failure_threshold.max(1),
            block_time,
            failures: moka::sync::Cache::builder()
                // A host without failures for an entire window has nothing left to count.
                .time_to_idle(time_window)
                .build(),
            blocked_hosts: moka::sync::Cache::builder()
                .time_to_live(block_time)
                .eviction_listener(|host, _, _| tracing::info!(%host, "Unblocking image origin"))
                .build(),
        }
    }

    /// Rounds a duration down to a multiple of the configured bucket size.
    fn round_duration(&self, duration: Duration) -> u64 {
        let duration = duration.as_millis() as u64;

        duration - (duration % self.bucket_size_millis)
    }

    /// The maximum length of the failure queue for one host.
    fn max_queue_len(&self) -> usize {
        // Add one to protect against round issues if `time_window` is not a multiple of `bucket_size`.
        (self.time_window_millis / self.bucket_size_millis) as usize + 1
    }

    /// Registers a probe failure against the host of `url`.
    ///
    /// If that puts the host over the threshold, it is blocked.
    pub fn register_failure(&self, url: &Url, error: &ProbeError) {
        if !error.is_transient() {
            return;
        }
        let Some(host) = host_key(url) else {
            return;
        };

        // Concurrent probes against a blocked host can still fail after the block.
        if self.blocked_hosts.contains_key(&host) {
            return;
        }

        let now = SystemTime::now();
        tracing::trace!(
            host = %host,
            time = %humantime::format_rfc3339(now),
            %error,
            "Registering probe failure"
        );

        let current_ts = now
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let current_ts = self.round_duration(current_ts);

        let entry = self.failures.entry_by_ref(&host).or_default();
        let mut queue = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        match queue.back_mut() {
            Some(last) if last.timestamp == current_ts => {
                last.failures += 1;
            }
            _ => {
                queue.push_back(FailureCount {
                    timestamp: current_ts,
                    failures: 1,
                });
            }
        }

        if queue.len() > self.max_queue_len() {
            queue.pop_front();
        }

        let cutoff = current_ts.saturating_sub(self.time_window_millis);
        let total_failures: usize = queue
            .iter()
            .skip_while(|failure_count| failure_count.timestamp < cutoff)
            .map(|failure_count| failure_count.failures)
            .sum();

        if total_failures >= self.failure_threshold {
            tracing::info!(
                %host,
                block_time = %humantime::format_duration(self.block_time),
                %error,
                "Blocking image origin due to too many probe failures"
            );
            queue.clear();
            drop(queue);

            self.blocked_hosts.insert(host, error.clone());
            metric!(gauge("images.origin.blocked") = self.blocked_hosts.entry_count());
        }
    }

    /// If the host of `url` is blocked, returns the error probes fail with.
    pub fn check(&self, url: &Url) -> Result<(), ProbeError> {
        let Some(host) = host_key(url) else {
            return Ok(());
        };
        match self.blocked_hosts.get(&host) {
            Some(reason) => Err(ProbeError::DownloadError(format!(
                "Host {host} is temporarily blocked because there were too many probe failures. \
                 It will remain blocked for a maximum of {}. The error that triggered the block was: `{reason}`.",
                humantime::format_duration(self.block_time),
            ))),
            None => Ok(()),
        }
    }
}

fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        "https://ik.imagekit.io/a7kelms9a/brand-images/gefu/G1_1.webp"
            .parse()
            .unwrap()
    }

    fn guard(threshold: usize) -> OriginGuard {
        OriginGuard::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            threshold,
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_origin_guard() {
        let guard = guard(2);
        let error = ProbeError::DownloadError("502 Bad Gateway".to_owned());

        guard.register_failure(&url(), &error);
        // shouldn't be blocked after one failure
        assert!(guard.check(&url()).is_ok());

        guard.register_failure(&url(), &error);
        // should be blocked after two failures
        let blocked = guard.check(&url()).unwrap_err();
        assert!(blocked.is_transient());
        assert!(blocked.to_string().contains("ik.imagekit.io"));

        std::thread::sleep(Duration::from_millis(100));

        // should be unblocked after 100ms have passed
        assert!(guard.check(&url()).is_ok());
    }

    #[test]
    fn test_not_found_does_not_count() {
        let guard = guard(1);
        guard.register_failure(&url(), &ProbeError::NotFound);
        guard.register_failure(&url(), &ProbeError::PermissionDenied("403 Forbidden".into()));
        assert!(guard.check(&url()).is_ok());
    }

    #[test]
    fn test_hosts_are_separate() {
        let guard = guard(1);
        guard.register_failure(&url(), &ProbeError::Timeout(Duration::from_secs(5)));

        let other: Url = "http://localhost:8080/brand-images/gefu/G1_1.webp".parse().unwrap();
        assert!(guard.check(&url()).is_err());
        assert!(guard.check(&other).is_ok());
    }
}
