//! Turns per-slice IPC/MPKI samples into full per-way curves.
//!
//! Ported from the curve-fitting half of `sigthyme_handler` plus
//! `cache_utils.cpp::smoothenMRCs`/`smoothenIPCs`. Three steps, each its
//! own piece here: [`CurveBuilder`] folds in one slice's raw counter
//! deltas and, once every slice has a sample, linearly interpolates them
//! out to one point per way; [`CurveHistory`] keeps a sliding window of
//! those per-invocation curves and averages them; [`enforce_monotonic`]
//! applies the non-increasing/non-decreasing correction, done once at
//! emission rather than on every intermediate estimate.

/// Result of folding in one slice's counter deltas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// Instruction and cycle deltas were recorded normally.
    Collected,
    /// `delta_instructions == 0`: the hardware counters did not advance
    /// between phases (observed errata on some platforms). The slice is
    /// marked incomplete and the curve for this invocation is discarded.
    CounterGlitch,
}

/// Accumulates one pass over a [`crate::plan::SamplingPlanner`]'s slices
/// and reduces them to per-way IPC/MPKI curves.
pub struct CurveBuilder {
    cache_num_ways: u32,
    x_ways: Vec<f64>,
    y_ipc: Vec<f64>,
    y_mpki: Vec<f64>,
    glitched: bool,
}

impl CurveBuilder {
    pub fn new(num_slices: usize, cache_num_ways: u32) -> Self {
        Self {
            cache_num_ways,
            x_ways: vec![0.0; num_slices],
            y_ipc: vec![0.0; num_slices],
            y_mpki: vec![0.0; num_slices],
            glitched: false,
        }
    }

    /// Folds in the counter deltas collected over one slice.
    ///
    /// `delta_mem_traffic_bytes` is the bandwidth-monitor delta for the
    /// same interval; dividing by `cache_line_size` turns it into a miss
    /// count, matching `misses = ΔmemTraffic / cache_line_size`.
    pub fn record(
        &mut self,
        slice_idx: usize,
        target_ways: u32,
        delta_instructions: f64,
        delta_cycles: f64,
        delta_mem_traffic_bytes: f64,
        cache_line_size: f64,
    ) -> SampleOutcome {
        self.x_ways[slice_idx] = target_ways as f64;

        if delta_instructions == 0.0 {
            self.glitched = true;
            return SampleOutcome::CounterGlitch;
        }

        let misses = delta_mem_traffic_bytes / cache_line_size;
        self.y_ipc[slice_idx] = delta_instructions / delta_cycles;
        self.y_mpki[slice_idx] = misses * 1000.0 / delta_instructions;
        SampleOutcome::Collected
    }

    pub fn glitched(&self) -> bool {
        self.glitched
    }

    /// Interpolates the collected slices out to one point per way,
    /// `1..=cache_num_ways`. The first slice is always warmup (the
    /// target thread hasn't settled into its newly allocated ways yet)
    /// and is overwritten with the second slice's reading before
    /// interpolating, matching the original's "ignore the first
    /// reading" comment. The final way-point is replaced with the
    /// second-to-last (tail replication), since the plan never samples
    /// the full cache capacity directly.
    pub fn interpolate(&self) -> (Vec<f64>, Vec<f64>) {
        let mut x = self.x_ways.clone();
        let mut ipc = self.y_ipc.clone();
        let mut mpki = self.y_mpki.clone();

        if x.len() > 1 {
            x[0] = x[1];
            ipc[0] = ipc[1];
            mpki[0] = mpki[1];
        }

        let n = self.cache_num_ways as usize;
        let mut ipc_out = linear_interp(&x, &ipc, n);
        let mut mpki_out = linear_interp(&x, &mpki, n);

        if n >= 2 {
            ipc_out[n - 1] = ipc_out[n - 2];
            mpki_out[n - 1] = mpki_out[n - 2];
        }

        (mpki_out, ipc_out)
    }
}

/// Linearly interpolates `(xs[i], ys[i])` samples onto query points
/// `1, 2, ..., n`. Samples are sorted by `x` first since the plan visits
/// way counts in decreasing order; queries outside the sample range
/// clamp to the nearest endpoint.
fn linear_interp(xs: &[f64], ys: &[f64], n: usize) -> Vec<f64> {
    let mut pairs: Vec<(f64, f64)> = xs.iter().copied().zip(ys.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    (1..=n)
        .map(|way| interp_one(&pairs, way as f64))
        .collect()
}

fn interp_one(pairs: &[(f64, f64)], xq: f64) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    if xq <= pairs[0].0 {
        return pairs[0].1;
    }
    if xq >= pairs[pairs.len() - 1].0 {
        return pairs[pairs.len() - 1].1;
    }
    for w in pairs.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        if xq >= x0 && xq <= x1 {
            if x1 == x0 {
                return y0;
            }
            let t = (xq - x0) / (x1 - x0);
            return y0 + t * (y1 - y0);
        }
    }
    pairs[pairs.len() - 1].1
}

/// Sliding window of per-invocation curve estimates for one thread,
/// averaged on read. Ported from the `startCol..=endCol` window used
/// right before `dump_mrc_estimates`/`dump_ipc_estimates`.
pub struct CurveHistory {
    window: usize,
    mpki: Vec<Vec<f64>>,
    ipc: Vec<Vec<f64>>,
}

impl CurveHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            mpki: Vec::new(),
            ipc: Vec::new(),
        }
    }

    pub fn push(&mut self, mpki: Vec<f64>, ipc: Vec<f64>) {
        self.mpki.push(mpki);
        self.ipc.push(ipc);
    }

    pub fn len(&self) -> usize {
        self.mpki.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mpki.is_empty()
    }

    /// Every pushed MPKI column in emission order, for writing the full
    /// `<prefix>_mrc_<tid>` history: one column per completed estimate.
    pub fn mpki_columns(&self) -> &[Vec<f64>] {
        &self.mpki
    }

    /// Every pushed IPC column in emission order.
    pub fn ipc_columns(&self) -> &[Vec<f64>] {
        &self.ipc
    }

    /// Averages the last `window + 1` pushed curves, matching
    /// `startCol = max(0, mrc_est_index - HIST_WINDOW_LENGTH)` through
    /// `endCol = mrc_est_index` inclusive.
    pub fn average(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        if self.mpki.is_empty() {
            return None;
        }
        let end = self.mpki.len();
        let start = end.saturating_sub(self.window + 1);
        Some((
            average_columns(&self.mpki[start..end]),
            average_columns(&self.ipc[start..end]),
        ))
    }
}

fn average_columns(curves: &[Vec<f64>]) -> Vec<f64> {
    let num_ways = curves[0].len();
    let mut out = vec![0.0; num_ways];
    for w in 0..num_ways {
        let sum: f64 = curves.iter().map(|c| c[w]).sum();
        out[w] = sum / curves.len() as f64;
    }
    out
}

/// Enforces MPKI non-increasing and IPC non-decreasing in allocated ways,
/// done once at emission. Ported from `smoothenMRCs`/`smoothenIPCs`.
pub fn enforce_monotonic(mpki: &mut [f64], ipc: &mut [f64]) {
    for i in 1..mpki.len() {
        mpki[i] = mpki[i - 1].min(mpki[i]);
    }
    for i in 1..ipc.len() {
        ipc[i] = ipc[i - 1].max(ipc[i]);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_glitch_is_reported_and_flagged() {
        let mut builder = CurveBuilder::new(3, 6);
        let outcome = builder.record(0, 5, 0.0, 1000.0, 0.0, 64.0);
        assert_eq!(outcome, SampleOutcome::CounterGlitch);
        assert!(builder.glitched());
    }

    #[test]
    fn ipc_and_mpki_formulas() {
        let mut builder = CurveBuilder::new(1, 6);
        // delta_instr=2000, delta_cycles=1000 -> ipc=2.0
        // delta_mem_traffic=6400 bytes / 64 = 100 misses -> mpki = 100*1000/2000 = 50
        let outcome = builder.record(0, 5, 2000.0, 1000.0, 6400.0, 64.0);
        assert_eq!(outcome, SampleOutcome::Collected);
        assert_eq!(builder.y_ipc[0], 2.0);
        assert_eq!(builder.y_mpki[0], 50.0);
    }

    #[test]
    fn interpolate_produces_one_point_per_way_with_tail_replication() {
        let mut builder = CurveBuilder::new(3, 6);
        builder.record(0, 5, 2000.0, 1000.0, 640.0, 64.0);
        builder.record(1, 3, 1000.0, 1000.0, 640.0, 64.0);
        builder.record(2, 1, 500.0, 1000.0, 640.0, 64.0);
        let (mpki, ipc) = builder.interpolate();
        assert_eq!(mpki.len(), 6);
        assert_eq!(ipc.len(), 6);
        assert_eq!(mpki[5], mpki[4]);
        assert_eq!(ipc[5], ipc[4]);
    }

    /// Drives the W=6, plan `{5,5,4,3,2,1}` scenario through `record`/
    /// `interpolate` with the same per-way IPC/MPKI readings as the
    /// worked example, then checks the emitted columns against the
    /// original's actual `interp1("linear")` result rather than the
    /// distilled numbers (which clamp way=4's IPC to 0.85 and MPKI to
    /// 4.0 — inconsistent with a direct linear interpolation of its own
    /// stated samples, since way 4 has an exact sample and needs no
    /// interpolation at all). With `xPoints`/`yPoints` duplicated at the
    /// warmup slot (`x[0] = x[1]`, ...) every other way lands exactly on
    /// a sample, so `interp1` returns the sample itself.
    #[test]
    fn scenario_one_matches_original_interp1_ground_truth() {
        let mut builder = CurveBuilder::new(6, 6);
        // target_ways per slice: 5, 5, 4, 3, 2, 1 (slice 0 is warmup and
        // its reading is discarded by `interpolate`, so any consistent
        // values work there).
        let slices = [
            (5u32, 1000.0, 1000.0, 128.0),
            (5, 1000.0, 1000.0, 128.0),
            (4, 900.0, 1000.0, 172.8),
            (3, 700.0, 1000.0, 224.0),
            (2, 500.0, 1000.0, 256.0),
            (1, 200.0, 1000.0, 192.0),
        ];
        for (idx, &(ways, delta_instr, delta_cycles, delta_mem)) in slices.iter().enumerate() {
            let outcome = builder.record(idx, ways, delta_instr, delta_cycles, delta_mem, 64.0);
            assert_eq!(outcome, SampleOutcome::Collected);
        }

        let (mpki, ipc) = builder.interpolate();
        assert_eq!(ipc, vec![0.2, 0.5, 0.7, 0.9, 1.0, 1.0]);
        assert_eq!(mpki, vec![15.0, 8.0, 5.0, 3.0, 2.0, 2.0]);
    }

    #[test]
    fn history_average_respects_window_size() {
        let mut history = CurveHistory::new(1);
        history.push(vec![10.0], vec![1.0]);
        history.push(vec![20.0], vec![2.0]);
        history.push(vec![30.0], vec![3.0]);
        // window=1 means last 2 entries average: (20+30)/2=25, (2+3)/2=2.5
        let (mpki, ipc) = history.average().unwrap();
        assert_eq!(mpki, vec![25.0]);
        assert_eq!(ipc, vec![2.5]);
    }

    #[test]
    fn monotonic_correction_clamps_mpki_down_and_ipc_up() {
        let mut mpki = vec![10.0, 12.0, 8.0, 9.0];
        let mut ipc = vec![1.0, 0.8, 1.5, 1.4];
        enforce_monotonic(&mut mpki, &mut ipc);
        assert_eq!(mpki, vec![10.0, 10.0, 8.0, 8.0]);
        assert_eq!(ipc, vec![1.0, 1.0, 1.5, 1.5]);
    }
}
