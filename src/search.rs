//! Brute-force sliding window search over the catalogue.
//!
//! Every stored sequence at least as long as the query is compared against it at every
//! offset. The score of a window is the mean squared difference between its values and the
//! query's, so lower is better and 0 is an exact match.
//!
//! The scan is not exhaustive once something near-perfect turns up (see
//! [crate::NEAR_PERFECT_SCORE]): the current video is abandoned as soon as a window scores
//! below it, and no further videos are scanned after that. Videos are visited in catalogue
//! id order, so when several videos contain an equally good match, the one with the
//! smallest id wins.
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::store::{CatalogueRecord, FingerprintRows, FingerprintStore};
use crate::video::{Fingerprint, Sampler, FINGERPRINT_LEN};
use crate::{Error, Result, NEAR_PERFECT_SCORE};

/// Best window found by a search.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub video_id: String,
    /// Display name of the matched video.
    pub name: String,
    /// Index of the first fingerprint of the window.
    pub offset: usize,
    /// `offset` converted to seconds using the rate the video was sampled at.
    pub start_offset_sec: f64,
    pub score: f64,
}

impl Display for MatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {:.2}s (score {:.5})",
            self.name, self.start_offset_sec, self.score
        )
    }
}

/// Mean squared difference between `query` and the window of `rows` starting at `offset`.
///
/// The mean is taken over all `query.len() * 8` values. Panics if the window runs past
/// the end of `rows`.
pub fn window_score<R: FingerprintRows + ?Sized>(
    rows: &R,
    offset: usize,
    query: &[Fingerprint],
) -> f64 {
    let mut sum = 0.0;
    for (k, q) in query.iter().enumerate() {
        let w = rows.row(offset + k);
        for (a, b) in w.iter().zip(q.iter()) {
            let d = a - b;
            sum += d * d;
        }
    }
    sum / (query.len() * FINGERPRINT_LEN) as f64
}

#[derive(Debug, Default)]
struct VideoScan {
    // (offset, score)
    best: Option<(usize, f64)>,
    windows: usize,
}

fn scan_video<R: FingerprintRows + ?Sized>(rows: &R, query: &[Fingerprint]) -> VideoScan {
    let mut scan = VideoScan::default();
    if rows.len() < query.len() {
        return scan;
    }

    for offset in 0..=rows.len() - query.len() {
        let score = window_score(rows, offset, query);
        scan.windows += 1;
        if scan.best.map_or(true, |(_, best)| score < best) {
            scan.best = Some((offset, score));
        }
        if score < NEAR_PERFECT_SCORE {
            break;
        }
    }

    scan
}

enum VideoOutcome {
    Scanned { scan: VideoScan, sample_rate: f64 },
    TooShort,
    Unreadable,
    /// Sampled at a different rate or frame size than the query.
    Incompatible,
    NotStarted,
}

/// Counters and best candidate of a single catalogue scan, before thresholding.
#[derive(Debug, Default)]
pub(crate) struct ScanReport {
    pub(crate) best: Option<MatchResult>,
    /// Number of windows scored.
    pub(crate) windows: usize,
    pub(crate) videos_scanned: usize,
    /// Videos whose sequence file could not be read, or whose sampling settings differ
    /// from the query's.
    pub(crate) videos_skipped: usize,
}

impl ScanReport {
    fn add(&mut self, id: &str, record: &CatalogueRecord, outcome: VideoOutcome) {
        match outcome {
            VideoOutcome::Scanned { scan, sample_rate } => {
                self.videos_scanned += 1;
                self.windows += scan.windows;
                if let Some((offset, score)) = scan.best {
                    if self.best.as_ref().map_or(true, |b| score < b.score) {
                        self.best = Some(MatchResult {
                            video_id: id.to_owned(),
                            name: record.name.clone(),
                            offset,
                            start_offset_sec: offset as f64 / sample_rate,
                            score,
                        });
                    }
                }
            }
            VideoOutcome::Unreadable | VideoOutcome::Incompatible => self.videos_skipped += 1,
            VideoOutcome::TooShort | VideoOutcome::NotStarted => (),
        }
    }

    fn is_near_perfect(&self) -> bool {
        self.best
            .as_ref()
            .map_or(false, |b| b.score < NEAR_PERFECT_SCORE)
    }
}

/// Searches a [FingerprintStore] for the window that best matches a query.
///
/// # Example
///
/// ```
/// use clipseek::{FingerprintStore, Searcher};
///
/// let store = FingerprintStore::open("./data/video_db").unwrap();
/// let query = store.extract_query("clip.mp4").unwrap();
/// let result = Searcher::default()
///     .with_threshold(0.2)
///     .search(&store, &query)
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Searcher {
    threshold: f64,
    threading: bool,
    cancel: Option<Arc<AtomicBool>>,
    sample_rate: Option<f64>,
    frame_size: Option<(u32, u32)>,
}

impl Default for Searcher {
    fn default() -> Self {
        Self {
            threshold: crate::DEFAULT_MATCH_THRESHOLD,
            threading: false,
            cancel: None,
            sample_rate: None,
            frame_size: None,
        }
    }
}

impl Searcher {
    /// Returns a new [Searcher] that only accepts matches scoring strictly below `threshold`.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Returns a new [Searcher] that scans videos in parallel.
    ///
    /// Without the `rayon` feature this has no effect. A parallel scan keeps the early
    /// exit within each video, but videos already in flight when a near-perfect match
    /// turns up are still scanned to the end. The lowest score wins; among equal scores,
    /// the video that comes first in the catalogue wins. Since a video may never be
    /// started once another one matched, which of several equally good videos is
    /// reported is not fixed.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    /// Returns a new [Searcher] that aborts with [Error::SearchCancelled] once `cancel`
    /// is set. The flag is checked before each video.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns a new [Searcher] that only scans sequences sampled the way `sampler`
    /// samples, i.e. the sampler the query was extracted with.
    ///
    /// Sequences with a different sample rate, or a different frame size when both sizes
    /// are known, are skipped with a warning. Without this, every sequence is scanned.
    pub fn with_sampler(mut self, sampler: &Sampler) -> Self {
        self.sample_rate = Some(sampler.target_fps());
        self.frame_size = Some(sampler.target_size());
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |c| c.load(Ordering::Relaxed))
    }

    /// Scans the catalogue of `store` and returns the best match, if it scores strictly
    /// below the threshold.
    ///
    /// Videos whose sequence file is missing or unreadable are skipped with a warning, as are
    /// videos sampled differently from the query (see [Searcher::with_sampler]).
    pub fn search(
        &self,
        store: &FingerprintStore,
        query: &[Fingerprint],
    ) -> Result<Option<MatchResult>> {
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let span = tracing::span!(tracing::Level::TRACE, "search", query_len = query.len());
        let _enter = span.enter();
        let started = Instant::now();

        let report = self.scan(store, query)?;

        tracing::info!(
            windows = report.windows,
            videos_scanned = report.videos_scanned,
            videos_skipped = report.videos_skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search finished"
        );

        match report.best {
            Some(m) if m.score < self.threshold => Ok(Some(m)),
            Some(m) => {
                tracing::debug!(
                    score = m.score,
                    threshold = self.threshold,
                    "best candidate rejected"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // Sequences written before frame sizes were recorded report `None` and are only
    // checked by rate.
    fn incompatibility(&self, sample_rate: f64, frame_size: Option<(u32, u32)>) -> Option<String> {
        if let Some(rate) = self.sample_rate {
            if (sample_rate - rate).abs() > 1e-9 * rate.abs().max(1.0) {
                return Some(format!(
                    "sampled at {} fps, query at {} fps",
                    sample_rate, rate
                ));
            }
        }
        match (frame_size, self.frame_size) {
            (Some(stored), Some(wanted)) if stored != wanted => Some(format!(
                "frames resized to {}x{}, query to {}x{}",
                stored.0, stored.1, wanted.0, wanted.1
            )),
            _ => None,
        }
    }

    fn scan_entry(
        &self,
        store: &FingerprintStore,
        id: &str,
        record: &CatalogueRecord,
        query: &[Fingerprint],
    ) -> Result<VideoOutcome> {
        if self.is_cancelled() {
            return Err(Error::SearchCancelled);
        }
        if record.frame_count < query.len() {
            return Ok(VideoOutcome::TooShort);
        }

        let view = match store.open_sequence(id, record) {
            Ok(view) => view,
            Err(e) => {
                tracing::warn!("skipping {} ({}): {}", record.name, id, e);
                return Ok(VideoOutcome::Unreadable);
            }
        };

        if let Some(reason) = self.incompatibility(view.sample_rate(), view.frame_size()) {
            tracing::warn!("skipping {} ({}): {}", record.name, id, reason);
            return Ok(VideoOutcome::Incompatible);
        }

        let scan = scan_video(&view, query);
        tracing::debug!(
            windows = scan.windows,
            best = ?scan.best,
            "scanned {} ({})",
            record.name,
            id
        );

        Ok(VideoOutcome::Scanned {
            scan,
            sample_rate: view.sample_rate(),
        })
    }

    pub(crate) fn scan(&self, store: &FingerprintStore, query: &[Fingerprint]) -> Result<ScanReport> {
        let catalogue = store.get_catalogue();

        #[cfg(feature = "rayon")]
        if self.threading {
            return self.scan_parallel(store, &catalogue, query);
        }

        let mut report = ScanReport::default();
        for (id, record) in &catalogue {
            let outcome = self.scan_entry(store, id, record, query)?;
            report.add(id, record, outcome);
            if report.is_near_perfect() {
                break;
            }
        }

        Ok(report)
    }

    #[cfg(feature = "rayon")]
    fn scan_parallel(
        &self,
        store: &FingerprintStore,
        catalogue: &std::collections::BTreeMap<String, CatalogueRecord>,
        query: &[Fingerprint],
    ) -> Result<ScanReport> {
        let entries: Vec<(&String, &CatalogueRecord)> = catalogue.iter().collect();
        let stop = AtomicBool::new(false);

        let outcomes = entries
            .par_iter()
            .map(|(id, record)| -> Result<VideoOutcome> {
                if stop.load(Ordering::Relaxed) {
                    return Ok(VideoOutcome::NotStarted);
                }
                let outcome = self.scan_entry(store, id, record, query)?;
                if let VideoOutcome::Scanned { scan, .. } = &outcome {
                    if scan.best.map_or(false, |(_, s)| s < NEAR_PERFECT_SCORE) {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
                Ok(outcome)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = ScanReport::default();
        for ((id, record), outcome) in entries.into_iter().zip(outcomes) {
            report.add(id, record, outcome);
        }

        Ok(report)
    }
}
