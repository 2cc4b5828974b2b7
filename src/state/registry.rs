//! URL state registry
//!
//! The registry is the single source of truth for what happened to every URL
//! the crawl has seen. Session-wide counters are updated inside the same call
//! that changes a record, so the two can never drift apart.

use crate::state::url_record::{UrlRecord, UrlState};
use crate::url::UrlFilter;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Aggregated registry counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    /// Distinct URLs the filter allowed
    pub allowed: u64,
    /// Distinct URLs the filter denied
    pub denied: u64,
    /// URLs currently waiting or in flight
    pub queued: u64,
    pub downloaded: u64,
    pub skipped: u64,
    /// Body bytes actually transferred
    pub bytes_total: u64,
    /// Mean throughput over recorded transfers, in bytes per millisecond
    pub average_throughput: f64,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allowed={} denied={} queued={} downloaded={} skipped={} bytes={} avg={:.2}B/ms",
            self.allowed,
            self.denied,
            self.queued,
            self.downloaded,
            self.skipped,
            self.bytes_total,
            self.average_throughput
        )
    }
}

/// URLs grouped by filter decision, most frequently asked first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterAnalysis {
    pub allowed: Vec<(String, u32)>,
    pub denied: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    allowed: u64,
    denied: u64,
    queued: u64,
    downloaded: u64,
    skipped: u64,
}

impl Counters {
    fn slot(&mut self, state: UrlState) -> Option<&mut u64> {
        match state {
            UrlState::New => None,
            UrlState::Queued => Some(&mut self.queued),
            UrlState::Downloaded => Some(&mut self.downloaded),
            UrlState::Skipped => Some(&mut self.skipped),
        }
    }

    fn moved(&mut self, from: UrlState, to: UrlState) {
        if let Some(count) = self.slot(from) {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = self.slot(to) {
            *count += 1;
        }
    }
}

/// Owns one [`UrlRecord`] per normalized URL
///
/// Keys are the string form of already-normalized URLs; callers normalize
/// before asking.
pub struct UrlRegistry {
    records: HashMap<String, UrlRecord>,
    filter: Arc<dyn UrlFilter>,
    counters: Counters,
    bytes_total: u64,
    throughput_sum: f64,
    throughput_samples: u64,
}

impl UrlRegistry {
    pub fn new(filter: Arc<dyn UrlFilter>) -> Self {
        Self {
            records: HashMap::new(),
            filter,
            counters: Counters::default(),
            bytes_total: 0,
            throughput_sum: 0.0,
            throughput_samples: 0,
        }
    }

    /// Returns the record for a URL, creating a fresh one if needed
    ///
    /// The filter decision is not computed here; see [`Self::query_allowed`].
    pub fn get_or_create(&mut self, url: &Url) -> &UrlRecord {
        self.records.entry(url.as_str().to_string()).or_default()
    }

    pub fn record(&self, url: &Url) -> Option<&UrlRecord> {
        self.records.get(url.as_str())
    }

    /// Current lifecycle state; unknown URLs are `New`
    pub fn state(&self, url: &Url) -> UrlState {
        self.record(url).map(|r| r.state).unwrap_or_default()
    }

    /// Asks whether a URL may be mirrored
    ///
    /// Every call counts towards `asked_count`; the filter itself runs only
    /// on the first call for a given URL.
    pub fn query_allowed(&mut self, url: &Url) -> bool {
        let record = self.records.entry(url.as_str().to_string()).or_default();
        record.asked_count += 1;

        if let Some(allowed) = record.allowed {
            return allowed;
        }

        let allowed = self.filter.allows(url);
        record.allowed = Some(allowed);
        if allowed {
            self.counters.allowed += 1;
        } else {
            self.counters.denied += 1;
        }
        tracing::trace!("Filter decision for {}: {}", url, allowed);
        allowed
    }

    fn transition(&mut self, url: &Url, to: UrlState) -> bool {
        let record = self.records.entry(url.as_str().to_string()).or_default();
        if !record.state.can_transition_to(to) {
            return false;
        }
        let from = std::mem::replace(&mut record.state, to);
        self.counters.moved(from, to);
        true
    }

    /// Moves a new URL into the queue; no-op (returns false) otherwise
    pub fn mark_queued(&mut self, url: &Url) -> bool {
        self.transition(url, UrlState::Queued)
    }

    /// Marks a queued URL as mirrored; no-op (returns false) otherwise
    pub fn mark_downloaded(&mut self, url: &Url) -> bool {
        self.transition(url, UrlState::Downloaded)
    }

    /// Marks a queued URL as given up; no-op (returns false) otherwise
    pub fn mark_skipped(&mut self, url: &Url) -> bool {
        self.transition(url, UrlState::Skipped)
    }

    /// Returns a finished URL to `New` so that it can be queued again
    ///
    /// Only used for explicit re-additions; the crawl itself never re-queues a
    /// terminal URL.
    pub fn reconsider(&mut self, url: &Url) -> bool {
        let Some(record) = self.records.get_mut(url.as_str()) else {
            return false;
        };
        if !record.state.is_terminal() {
            return false;
        }
        let from = std::mem::replace(&mut record.state, UrlState::New);
        self.counters.moved(from, UrlState::New);
        true
    }

    /// Accounts one finished transfer
    pub fn record_transfer(&mut self, bytes: u64, bytes_per_ms: f64) {
        self.bytes_total += bytes;
        if bytes_per_ms.is_finite() {
            self.throughput_sum += bytes_per_ms;
            self.throughput_samples += 1;
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let average_throughput = if self.throughput_samples > 0 {
            self.throughput_sum / self.throughput_samples as f64
        } else {
            0.0
        };
        RegistryStats {
            allowed: self.counters.allowed,
            denied: self.counters.denied,
            queued: self.counters.queued,
            downloaded: self.counters.downloaded,
            skipped: self.counters.skipped,
            bytes_total: self.bytes_total,
            average_throughput,
        }
    }

    /// Lists every asked-about URL by filter decision
    ///
    /// This walks and sorts the whole registry; meant for diagnostics at the
    /// end of a run, not for the crawl loop.
    pub fn filter_analysis(&self) -> FilterAnalysis {
        let mut analysis = FilterAnalysis::default();
        for (url, record) in &self.records {
            if record.asked_count == 0 {
                continue;
            }
            let entry = (url.clone(), record.asked_count);
            if record.is_allowed() {
                analysis.allowed.push(entry);
            } else {
                analysis.denied.push(entry);
            }
        }
        let by_count = |a: &(String, u32), b: &(String, u32)| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0));
        analysis.allowed.sort_by(by_count);
        analysis.denied.sort_by(by_count);
        analysis
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl fmt::Debug for UrlRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlRegistry")
            .field("records", &self.records.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn registry() -> UrlRegistry {
        UrlRegistry::new(Arc::new(|u: &Url| u.host_str() == Some("x")))
    }

    #[test]
    fn test_allowed_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut reg = UrlRegistry::new(Arc::new(move |_: &Url| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let u = url("http://x/a");
        for _ in 0..5 {
            assert!(reg.query_allowed(&u));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.record(&u).unwrap().asked_count, 5);
        assert_eq!(reg.stats().allowed, 1);
    }

    #[test]
    fn test_denied_counted_once() {
        let mut reg = registry();
        let u = url("http://elsewhere/a");
        assert!(!reg.query_allowed(&u));
        assert!(!reg.query_allowed(&u));
        let stats = reg.stats();
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.allowed, 0);
    }

    #[test]
    fn test_get_or_create_does_not_ask_filter() {
        let mut reg = registry();
        let u = url("http://x/a");
        let record = reg.get_or_create(&u);
        assert_eq!(record.allowed, None);
        assert_eq!(record.asked_count, 0);
        assert_eq!(reg.stats().allowed, 0);
    }

    #[test]
    fn test_lifecycle_counters() {
        let mut reg = registry();
        let a = url("http://x/a");
        let b = url("http://x/b");

        assert!(reg.mark_queued(&a));
        assert!(reg.mark_queued(&b));
        assert_eq!(reg.stats().queued, 2);

        assert!(reg.mark_downloaded(&a));
        assert!(reg.mark_skipped(&b));

        let stats = reg.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_invalid_transitions_are_noops() {
        let mut reg = registry();
        let u = url("http://x/a");

        // Not queued yet
        assert!(!reg.mark_downloaded(&u));
        assert!(!reg.mark_skipped(&u));

        assert!(reg.mark_queued(&u));
        assert!(!reg.mark_queued(&u));
        assert!(reg.mark_downloaded(&u));

        // Terminal: cannot be re-queued or re-marked implicitly
        assert!(!reg.mark_queued(&u));
        assert!(!reg.mark_skipped(&u));
        assert_eq!(reg.state(&u), UrlState::Downloaded);

        let stats = reg.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn test_reconsider_allows_explicit_requeue() {
        let mut reg = registry();
        let u = url("http://x/a");
        reg.mark_queued(&u);
        reg.mark_skipped(&u);

        assert!(reg.reconsider(&u));
        assert_eq!(reg.stats().skipped, 0);
        assert!(reg.mark_queued(&u));
        assert_eq!(reg.stats().queued, 1);

        // Queued records are not reset
        assert!(!reg.reconsider(&u));
    }

    #[test]
    fn test_states_stay_exclusive_under_random_operations() {
        let mut reg = registry();
        let urls: Vec<Url> = (0..5).map(|i| url(&format!("http://x/{}", i))).collect();
        for step in 0..200usize {
            let u = &urls[step % urls.len()];
            match (step * 7 + step / 3) % 4 {
                0 => {
                    reg.mark_queued(u);
                }
                1 => {
                    reg.mark_downloaded(u);
                }
                2 => {
                    reg.mark_skipped(u);
                }
                _ => {
                    reg.reconsider(u);
                }
            }
            let stats = reg.stats();
            let mut expected = (0, 0, 0);
            for u in &urls {
                match reg.state(u) {
                    UrlState::Queued => expected.0 += 1,
                    UrlState::Downloaded => expected.1 += 1,
                    UrlState::Skipped => expected.2 += 1,
                    UrlState::New => {}
                }
            }
            assert_eq!((stats.queued, stats.downloaded, stats.skipped), expected);
        }
    }

    #[test]
    fn test_transfer_accounting() {
        let mut reg = registry();
        reg.record_transfer(1000, 10.0);
        reg.record_transfer(500, 20.0);
        let stats = reg.stats();
        assert_eq!(stats.bytes_total, 1500);
        assert!((stats.average_throughput - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_filter_analysis_sorted_by_asked() {
        let mut reg = registry();
        let a = url("http://x/a");
        let b = url("http://x/b");
        let d = url("http://y/d");

        reg.query_allowed(&a);
        for _ in 0..3 {
            reg.query_allowed(&b);
        }
        reg.query_allowed(&d);
        reg.get_or_create(&url("http://x/never-asked"));

        let analysis = reg.filter_analysis();
        assert_eq!(
            analysis.allowed,
            vec![("http://x/b".to_string(), 3), ("http://x/a".to_string(), 1)]
        );
        assert_eq!(analysis.denied, vec![("http://y/d".to_string(), 1)]);
    }
}
