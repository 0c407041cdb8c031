//! Count-rate engine: turns the raw `(tstamp, tchannel)` arrays returned by the
//! time-to-digital converter into per-channel count rates.
//!
//! The converter's DMA buffer is usually larger than the number of events it holds and is padded
//! with zero timestamps on zero channels. Those pairs are not events; [`padded_len`] locates
//! the last genuine entry so that the padding can be cut off before any other processing.

use indexmap::IndexMap;
use serde::Serialize;

/// Returns the length of the raw arrays once trailing `(0, 0)` padding is removed.
///
/// Only the tail is inspected: interior zero entries (including a genuine event on channel 0 at
/// tick 0) are kept. If the arrays differ in length, the shorter one bounds the result.
pub fn padded_len(tstamp: &[i64], tchannel: &[u8]) -> usize {
    let len = std::cmp::min(tstamp.len(), tchannel.len());
    (0..len)
        .rev()
        .find(|&i| tstamp[i] != 0 || tchannel[i] != 0)
        .map_or(0, |last| last + 1)
}

/// Slices both arrays to their [`padded_len`].
pub fn strip_padding<'a>(tstamp: &'a [i64], tchannel: &'a [u8]) -> (&'a [i64], &'a [u8]) {
    let len = padded_len(tstamp, tchannel);
    (&tstamp[..len], &tchannel[..len])
}

/// Converts hardware ticks to seconds.
pub fn ticks_to_seconds(tstamp: &[i64], timebase: f64) -> Vec<f64> {
    tstamp.iter().map(|&tick| tick as f64 * timebase).collect()
}

/// Counts the events of each requested channel and normalizes by the sampling rate.
///
/// Every requested channel appears in the result in request order, with `0.` when it produced
/// no event during the window.
pub fn tally_counts(tchannel: &[u8], channels: &[u8], rate: f64) -> IndexMap<u8, f64> {
    let mut tally: IndexMap<u8, f64> = channels.iter().map(|&chan| (chan, 0.)).collect();
    for chan in tchannel {
        if let Some(count) = tally.get_mut(chan) {
            *count += 1.;
        }
    }
    tally.values_mut().for_each(|count| *count *= rate);
    tally
}

/// Copy of the rolling count history handed to callers, so that nobody observes the buffers
/// while the counting loop mutates them.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CountSnapshot {
    pub times: Vec<f64>,
    pub counts: IndexMap<u8, Vec<f64>>,
}

impl CountSnapshot {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty() && self.counts.values().all(|c| c.is_empty())
    }

    /// Mean of the last `window` summed count rates across all channels.
    /// Returns `None` when no sample has been recorded yet.
    ///
    /// Histories are aligned on their newest sample: a channel holding more entries than
    /// `times` contributes only its tail.
    pub fn recent_mean(&self, window: usize) -> Option<f64> {
        let samples = window.min(self.times.len());
        if samples == 0 {
            return None;
        }
        let total: f64 = self
            .counts
            .values()
            .map(|c| c[c.len().saturating_sub(samples)..].iter().sum::<f64>())
            .sum();
        Some(total / samples as f64)
    }
}
