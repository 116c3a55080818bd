//! Fixed-point exponentially weighted moving average.
//!
//! Values are tracked as scaled integers throughout; there is no
//! floating-point arithmetic on the update path. `alpha` (the decay factor)
//! is itself represented in Q32 fixed point so that compounding it over many
//! elapsed ticks can be done by repeated squaring instead of a per-tick
//! loop, without the exponent blowing up past `i128` range.

/// Fixed-point shift used for the internal alpha representation.
const ALPHA_FP_SHIFT: u32 = 32;
const ALPHA_FP_SCALE: i128 = 1 << ALPHA_FP_SHIFT;

/// An exponentially weighted moving average sampled at discrete ticks.
///
/// `average()` returns the running value in fixed point at `scale`; readers
/// combine it with `freq()` to report samples-per-second (see spec §4.1 and
/// §9 — the `average * freq / scale` product is part of the handler
/// contract, not an internal detail).
#[derive(Debug, Clone)]
pub struct Ewma {
    avg: i64,
    last_tick: u64,
    alpha_fp: i64,
    scale: i64,
    freq: u32,
}

impl Ewma {
    /// Create a fresh EWMA with the given tick frequency, averaging
    /// interval (in ticks), and fixed-point scale.
    ///
    /// `interval_ticks` approximates `1 / (1 - alpha)`, per spec §3.
    pub fn new(freq: u32, interval_ticks: u64, scale: i64) -> Self {
        let interval = interval_ticks.max(1) as i128;
        let alpha_fp = (ALPHA_FP_SCALE - ALPHA_FP_SCALE / interval).max(0) as i64;
        Self { avg: 0, last_tick: 0, alpha_fp, scale, freq }
    }

    /// Reset the running average to zero, keeping the configured shape.
    pub fn initialize(&mut self) {
        self.avg = 0;
        self.last_tick = 0;
    }

    /// The current scaled integer average.
    pub fn average(&self) -> i64 {
        self.avg
    }

    /// Ticks per second for this EWMA's tick source.
    pub fn freq(&self) -> u32 {
        self.freq
    }

    /// The fixed-point scale `average()` is expressed in.
    pub fn scale(&self) -> i64 {
        self.scale
    }

    /// Advance the average to `tick`, folding in `sample`.
    ///
    /// Ages the average over every elapsed tick since the last update
    /// (inserting zero samples), then folds `sample` in at `tick`. See
    /// spec §4.1 for the two-step algorithm this implements.
    ///
    /// A zero sample at a tick already accounted for (`tick ==
    /// last_tick`) is a true no-op rather than an extra decay step. Real
    /// traffic never presents a literal zero sample (`PACKETS` mode folds
    /// in `1`, `BYTES` mode folds in a positive header length), so the
    /// only caller that ever passes `sample == 0` is `fold`'s "age while
    /// checking coldness" housekeeping pass — without this no-op,
    /// re-invoking `fold` at the same tick with no intervening traffic
    /// would decay every visited counter an extra step each time,
    /// breaking fold's idempotence.
    pub fn update(&mut self, tick: u64, sample: i64) {
        if sample == 0 && tick == self.last_tick {
            return;
        }
        let elapsed = tick.saturating_sub(self.last_tick).max(1);
        self.avg = Self::decay(self.avg, self.alpha_fp, elapsed);
        let sample_scaled = (sample as i128) * (self.scale as i128);
        let complement = ALPHA_FP_SCALE - self.alpha_fp as i128;
        let folded = sample_scaled * complement / ALPHA_FP_SCALE;
        self.avg = (self.avg as i128 + folded) as i64;
        self.last_tick = tick;
    }

    /// `avg * alpha^steps`, computed by repeated squaring of the Q32
    /// fixed-point alpha so the exponent never overflows `i128`: each
    /// squaring stays bounded by `ALPHA_FP_SCALE` since `0 <= alpha <= 1`.
    fn decay(avg: i64, alpha_fp: i64, steps: u64) -> i64 {
        let mut base = alpha_fp as i128;
        let mut result: i128 = ALPHA_FP_SCALE;
        let mut e = steps;
        while e > 0 {
            if e & 1 == 1 {
                result = result * base / ALPHA_FP_SCALE;
            }
            base = base * base / ALPHA_FP_SCALE;
            e >>= 1;
        }
        (avg as i128 * result / ALPHA_FP_SCALE) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ewma_reads_zero() {
        let e = Ewma::new(1000, 1000, 1 << 16);
        assert_eq!(e.average(), 0);
    }

    #[test]
    fn single_sample_is_partially_folded() {
        let mut e = Ewma::new(1000, 4, 1 << 16);
        e.update(0, 100);
        assert!(e.average() > 0);
        assert!(e.average() < 100 * (1 << 16));
    }

    #[test]
    fn repeated_samples_converge_upward() {
        let mut e = Ewma::new(1000, 8, 1 << 16);
        let mut last = 0;
        for t in 0..500u64 {
            e.update(t, 10);
            assert!(e.average() >= last);
            last = e.average();
        }
        // Should have converged close to the steady-state input scaled value.
        let steady = 10i64 * (1 << 16);
        assert!((e.average() - steady).abs() < steady / 10);
    }

    #[test]
    fn aging_with_zero_samples_decays() {
        let mut e = Ewma::new(1000, 8, 1 << 16);
        for t in 0..200u64 {
            e.update(t, 10);
        }
        let peak = e.average();
        e.update(10_000, 0);
        assert!(e.average() < peak);
    }

    #[test]
    fn repeated_zero_sample_at_same_tick_is_a_no_op() {
        let mut e = Ewma::new(1000, 8, 1 << 16);
        e.update(5, 10);
        e.update(9, 0);
        let once = e.average();
        e.update(9, 0);
        e.update(9, 0);
        assert_eq!(e.average(), once);
    }

    #[test]
    fn initialize_clears_state() {
        let mut e = Ewma::new(1000, 8, 1 << 16);
        e.update(5, 50);
        assert!(e.average() != 0);
        e.initialize();
        assert_eq!(e.average(), 0);
    }
}
