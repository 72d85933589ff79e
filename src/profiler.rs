//! Named timing sections.
//!
//! Sections aggregate under their own lock, separate from the frame path. Each
//! measurement is also recorded as a `perigee_section_seconds` histogram.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

/// Aggregated timings of one section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl SectionStats {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Default)]
pub struct Profiler {
    enabled: AtomicBool,
    sections: Mutex<BTreeMap<String, SectionStats>>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            sections: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Times until the returned guard drops. Free when disabled.
    pub fn section<'a>(&'a self, name: &'a str) -> SectionGuard<'a> {
        SectionGuard {
            profiler: self,
            name,
            started: self.is_enabled().then(Instant::now),
        }
    }

    pub fn record(&self, name: &str, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        metrics::histogram!("perigee_section_seconds", "section" => name.to_string())
            .record(elapsed.as_secs_f64());
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = sections.entry(name.to_string()).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }

    pub fn stats(&self, name: &str) -> Option<SectionStats> {
        self.sections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Logs every section at info level.
    pub fn dump(&self) {
        let sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, stats) in sections.iter() {
            info!(
                section = %name,
                count = stats.count,
                mean_us = stats.mean().as_micros() as u64,
                max_us = stats.max.as_micros() as u64,
                "profile"
            );
        }
    }

    pub fn reset(&self) {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[must_use = "the section ends when the guard is dropped"]
pub struct SectionGuard<'a> {
    profiler: &'a Profiler,
    name: &'a str,
    started: Option<Instant>,
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(started) = self.started {
            self.profiler.record(self.name, started.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_aggregate() {
        let profiler = Profiler::new(true);
        profiler.record("decode", Duration::from_millis(2));
        profiler.record("decode", Duration::from_millis(4));
        {
            let _guard = profiler.section("publish");
        }
        let decode = profiler.stats("decode").unwrap();
        assert_eq!(decode.count, 2);
        assert_eq!(decode.max, Duration::from_millis(4));
        assert_eq!(decode.mean(), Duration::from_millis(3));
        assert_eq!(profiler.stats("publish").map(|s| s.count), Some(1));
        profiler.dump();
        profiler.reset();
        assert!(profiler.stats("decode").is_none());
    }

    #[test]
    fn mean_survives_huge_counts() {
        let stats = SectionStats {
            count: u64::from(u32::MAX) + 2,
            total: Duration::from_nanos(3 * (u64::from(u32::MAX) + 2)),
            max: Duration::from_nanos(5),
        };
        assert_eq!(stats.mean(), Duration::from_nanos(3));
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let profiler = Profiler::new(false);
        drop(profiler.section("decode"));
        profiler.record("decode", Duration::from_millis(1));
        assert!(profiler.stats("decode").is_none());
    }
}
