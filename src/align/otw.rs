use super::cost::CostMatrix;
use crate::config::SyncConfig;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView1};

/// Which sequence an aligner iteration advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Advance the reference index `j`; keep looking this tick.
    Reference,
    /// Wait for the next live frame.
    Live,
    /// Advance `j`, then wait for the next live frame.
    Both,
}

/// Tuning of the online aligner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OtwParams {
    /// Search width `c`: how many cells back each new row/column is evaluated
    pub search_width: usize,
    /// Maximum consecutive steps on one axis
    pub max_run_count: usize,
    /// Weight of the local cost on a diagonal step
    pub diag_weight: f32,
    /// Live capacity as a multiple of the reference length
    pub max_live_ratio: usize,
}

impl Default for OtwParams {
    fn default() -> Self {
        Self {
            search_width: 10,
            max_run_count: 3,
            diag_weight: 2.0,
            max_live_ratio: 4,
        }
    }
}

impl From<&SyncConfig> for OtwParams {
    fn from(config: &SyncConfig) -> Self {
        Self {
            search_width: config.search_width,
            max_run_count: config.max_run_count,
            diag_weight: config.diag_weight,
            max_live_ratio: config.max_live_ratio,
        }
    }
}

/// Live or reference columns whose bins are all within this of each other
/// carry no pitch information (the CENS fallback for silence).
const FLAT_TOLERANCE: f32 = 1e-6;

/// Local costs at or below this count as an exact match.
const MATCH_TOLERANCE: f32 = 1e-6;

fn is_flat<'a>(values: impl IntoIterator<Item = &'a f32>) -> bool {
    let (lo, hi) = values
        .into_iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    hi - lo <= FLAT_TOLERANCE
}

/// Online Time Warping (Dixon 2005) against a fixed reference sequence.
///
/// Every [`insert`](Self::insert) adds one live feature column and advances
/// the alignment frontier `(j, t)` by evaluating only a width-`c` strip of the
/// accumulated cost matrix, so each tick costs `O(c)` cell updates no matter
/// how long the session runs.
///
/// Ties between equally cheap cells go to the one nearest the frontier, so a
/// live stream identical to the reference walks the diagonal one frame per
/// tick even when consecutive reference frames are indistinguishable.
///
/// A flat live column (silence) against a non-flat reference frame holds the
/// frontier: `j` stays put, the accumulated costs are carried over unchanged
/// and the tick does not count towards the slope constraint. When the soloist
/// resumes, alignment continues from where it paused.
///
/// # Example
/// ```
/// use cadenza::align::{OnlineTimeWarping, OtwParams};
/// use ndarray::Array2;
///
/// // 3-dimensional toy features, one distinct unit vector per frame
/// let reference = Array2::from_shape_fn((3, 6), |(d, j)| if d == j % 3 { 1.0 } else { 0.0 });
/// let params = OtwParams { search_width: 2, ..OtwParams::default() };
/// let mut otw = OnlineTimeWarping::new(reference.clone(), params).unwrap();
/// for t in 0..6 {
///     let j = otw.insert(reference.column(t)).unwrap();
///     assert!(j < 6);
/// }
/// assert_eq!(otw.live_len(), 6);
/// ```
#[derive(Debug, Clone)]
pub struct OnlineTimeWarping {
    reference: Array2<f32>,
    live: Array2<f32>,
    cost: CostMatrix,
    params: OtwParams,
    live_len: usize,
    voiced: usize,
    flat_reference: Vec<bool>,
    j: usize,
    previous: Option<Step>,
    run_count: usize,
    last_estimate: usize,
    path: Vec<(usize, usize)>,
}

impl OnlineTimeWarping {
    /// Create an aligner over `reference` (`(n_features, R)`).
    ///
    /// # Errors
    /// `InvalidSize` for an empty reference, `InvalidParameter` for a zero
    /// search width, `max_run_count < 2`, a non-positive diagonal weight or a
    /// zero live ratio.
    pub fn new(reference: Array2<f32>, params: OtwParams) -> Result<Self> {
        let (n_features, ref_len) = reference.dim();
        if n_features == 0 || ref_len == 0 {
            return Err(Error::InvalidSize {
                name: "reference",
                value: n_features.min(ref_len),
                reason: "reference sequence must be non-empty",
            });
        }
        if params.search_width == 0 {
            return Err(Error::invalid("search_width", params.search_width, "must be >= 1"));
        }
        if params.max_run_count < 2 {
            return Err(Error::invalid("max_run_count", params.max_run_count, "must be >= 2"));
        }
        if !(params.diag_weight.is_finite() && params.diag_weight > 0.0) {
            return Err(Error::invalid("diag_weight", params.diag_weight, "must be positive"));
        }
        if params.max_live_ratio == 0 {
            return Err(Error::invalid("max_live_ratio", params.max_live_ratio, "must be >= 1"));
        }
        let capacity = ref_len * params.max_live_ratio;
        log::debug!(
            "OnlineTimeWarping: R={} capacity={} c={} max_run_count={} diag_weight={}",
            ref_len,
            capacity,
            params.search_width,
            params.max_run_count,
            params.diag_weight
        );
        let flat_reference = reference
            .columns()
            .into_iter()
            .map(|column| is_flat(column.iter()))
            .collect();
        Ok(Self {
            live: Array2::zeros((n_features, capacity)),
            cost: CostMatrix::new(ref_len, capacity),
            reference,
            params,
            live_len: 0,
            voiced: 0,
            flat_reference,
            j: 0,
            previous: None,
            run_count: 1,
            last_estimate: 0,
            path: Vec::new(),
        })
    }

    pub fn params(&self) -> &OtwParams {
        &self.params
    }

    /// Reference features `(n_features, R)`.
    pub fn reference(&self) -> &Array2<f32> {
        &self.reference
    }

    /// Reference length `R`.
    pub fn reference_len(&self) -> usize {
        self.reference.ncols()
    }

    /// Maximum number of live frames (`max_live_ratio · R`).
    pub fn capacity(&self) -> usize {
        self.live.ncols()
    }

    /// Number of live frames ingested so far.
    pub fn live_len(&self) -> usize {
        self.live_len
    }

    /// Index `t` of the newest live frame, if any.
    pub fn live_index(&self) -> Option<usize> {
        self.live_len.checked_sub(1)
    }

    /// Current reference index `j` of the alignment frontier.
    ///
    /// After a diagonal step this is one past [`estimate`](Self::estimate):
    /// the next reference row has been evaluated but not matched yet.
    pub fn reference_index(&self) -> usize {
        self.j
    }

    /// Latest estimated reference index, as returned by [`insert`](Self::insert).
    pub fn estimate(&self) -> usize {
        self.last_estimate
    }

    /// Number of live frames that carried pitch information.
    pub fn voiced_len(&self) -> usize {
        self.voiced
    }

    /// True once `j` has reached the last reference frame.
    pub fn at_end_of_reference(&self) -> bool {
        self.j + 1 == self.reference_len()
    }

    /// True when no further live frame can be inserted.
    pub fn is_full(&self) -> bool {
        self.live_len >= self.capacity()
    }

    /// Alignment path so far, oldest first. Entries advance by one on either
    /// axis or on both (a diagonal step), and the last entry's reference index
    /// is the current [`estimate`](Self::estimate).
    pub fn path(&self) -> &[(usize, usize)] {
        &self.path
    }

    /// Accumulated cost `D[j, t]` (`+∞` if never evaluated).
    pub fn cost(&self, j: usize, t: usize) -> f32 {
        self.cost.get(j, t)
    }

    /// Add one live feature column and return the estimated reference index.
    ///
    /// Returns `None` once the live sequence is full. A feature longer than
    /// the reference's feature dimension is truncated, a shorter one is
    /// zero-extended. A flat feature held against a non-flat reference frame
    /// returns the previous estimate unchanged.
    pub fn insert(&mut self, feature: ArrayView1<f32>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        if feature.len() != self.live.nrows() {
            log::warn!(
                "OnlineTimeWarping::insert: feature has {} dims, reference has {}",
                feature.len(),
                self.live.nrows()
            );
        }
        let t = self.live_len;
        let mut column = self.live.column_mut(t);
        column.fill(0.0);
        for (dst, &src) in column.iter_mut().zip(feature.iter()) {
            *dst = src;
        }
        self.live_len += 1;

        let c = self.params.search_width;
        let band = self.j.saturating_sub(c - 1)..=self.j;
        if is_flat(self.live.column(t).iter()) && !self.flat_reference[self.j] {
            for k in band {
                let carried = match t.checked_sub(1) {
                    Some(prev) => self.cost.get(k, prev),
                    None if k == 0 => 0.0,
                    None => f32::INFINITY,
                };
                self.cost.set(k, t, carried);
            }
            self.path.push((self.last_estimate, t));
            return Some(self.last_estimate);
        }
        self.voiced += 1;

        for k in band {
            self.evaluate(k, t);
        }
        self.path.push((self.j, t));

        let mut estimate = self.j;
        loop {
            let step = self.choose_step();
            if step == Step::Live {
                break;
            }
            self.j += 1;
            for k in t.saturating_sub(c - 1)..=t {
                self.evaluate(self.j, k);
            }
            if step == Step::Both {
                // matched up to the previous row; the next tick's column
                // completes the diagonal
                break;
            }
            estimate = self.j;
            self.path.push((self.j, t));
        }

        self.last_estimate = self.last_estimate.max(estimate);
        Some(self.last_estimate)
    }

    /// Greedy walk back through the cost matrix from the current frontier.
    ///
    /// At each cell moves to the cheapest of the up, left and diagonal
    /// predecessors (ties prefer up, then left), until `depth` reference rows
    /// have been covered or `(0, 0)` is reached. The result runs oldest first
    /// and ends at the current `(j, t)`.
    pub fn backtrack(&self, depth: usize) -> Vec<(usize, usize)> {
        let Some(mut t) = self.live_index() else {
            return Vec::new();
        };
        let mut j = self.j;
        let floor = self.j.saturating_sub(depth);
        let to_origin = depth > self.j;
        let mut path = vec![(j, t)];

        while (j > floor || to_origin) && (j, t) != (0, 0) {
            let up = if j > 0 { self.cost.get(j - 1, t) } else { f32::INFINITY };
            let left = if t > 0 { self.cost.get(j, t - 1) } else { f32::INFINITY };
            let diag = if j > 0 && t > 0 {
                self.cost.get(j - 1, t - 1)
            } else {
                f32::INFINITY
            };
            let best = up.min(left).min(diag);
            if best == f32::INFINITY {
                break;
            }
            if best == up {
                j -= 1;
            } else if best == left {
                t -= 1;
            } else {
                j -= 1;
                t -= 1;
            }
            path.push((j, t));
        }

        path.reverse();
        path
    }

    fn local_cost(&self, j: usize, t: usize) -> f32 {
        let dot = self.reference.column(j).dot(&self.live.column(t));
        let cost = (1.0 - dot).clamp(0.0, 1.0);
        // a unit vector's dot with itself can land an ulp below 1
        if cost <= MATCH_TOLERANCE { 0.0 } else { cost }
    }

    fn evaluate(&mut self, j: usize, t: usize) {
        let d = self.local_cost(j, t);
        if j == 0 && t == 0 {
            self.cost.set(0, 0, d);
            return;
        }
        let mut best = f32::INFINITY;
        if j > 0 && t > 0 {
            best = best.min(self.cost.get(j - 1, t - 1) + self.params.diag_weight * d);
        }
        if j > 0 {
            best = best.min(self.cost.get(j - 1, t) + d);
        }
        if t > 0 {
            best = best.min(self.cost.get(j, t - 1) + d);
        }
        self.cost.set(j, t, best);
    }

    fn choose_step(&mut self) -> Step {
        let (j, t) = (self.j, self.live_len - 1);
        let best_t = self.cost.row_argmin(j, t);
        let best_j = self.cost.col_argmin(j, t);

        let mut step = if self.cost.get(best_j, t) < self.cost.get(j, best_t) {
            Step::Live
        } else {
            Step::Reference
        };
        // both minima sit on the frontier cell itself
        if best_t == t && best_j == j {
            step = Step::Both;
        }
        if self.voiced <= self.params.search_width {
            step = Step::Both;
        }
        if self.run_count >= self.params.max_run_count {
            step = if self.previous == Some(Step::Reference) {
                Step::Live
            } else {
                Step::Reference
            };
        }

        if step == Step::Both || self.previous != Some(step) {
            self.run_count = 1;
        } else {
            self.run_count += 1;
        }
        self.previous = Some(step);

        if self.at_end_of_reference() {
            Step::Live
        } else {
            step
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// One-hot features cycling through `dims` dimensions.
    fn cycle(dims: usize, len: usize) -> Array2<f32> {
        Array2::from_shape_fn((dims, len), |(d, j)| if d == j % dims { 1.0 } else { 0.0 })
    }

    fn params(c: usize) -> OtwParams {
        OtwParams {
            search_width: c,
            ..OtwParams::default()
        }
    }

    #[test]
    fn test_identity_tracks_diagonal() {
        let reference = cycle(7, 40);
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(4)).unwrap();
        for t in 0..40 {
            let j = otw.insert(reference.column(t)).unwrap();
            assert_eq!(j, t);
        }
        assert_relative_eq!(otw.cost(0, 0), 0.0);
        assert!(otw.path().iter().all(|&(j, t)| j == t));
    }

    #[test]
    fn test_repeated_reference_frames_advance_one_per_tick() {
        // every cell ties when all frames are equal
        let reference = Array2::from_shape_fn((4, 30), |(d, _)| if d == 2 { 1.0 } else { 0.0 });
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(10)).unwrap();
        for t in 0..30 {
            assert_eq!(otw.insert(reference.column(t)), Some(t));
        }
        assert!(otw.at_end_of_reference());
    }

    #[test]
    fn test_silence_holds_the_frontier() {
        let reference = cycle(7, 40);
        let silence = ndarray::Array1::from_elem(7, 1.0 / 7f32.sqrt());
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(4)).unwrap();
        for t in 0..20 {
            assert_eq!(otw.insert(reference.column(t)), Some(t));
        }
        for _ in 0..15 {
            assert_eq!(otw.insert(silence.view()), Some(19));
        }
        assert_eq!(otw.voiced_len(), 20);
        assert_eq!(otw.path().last(), Some(&(19, 34)));
        for t in 20..40 {
            assert_eq!(otw.insert(reference.column(t)), Some(t));
        }
        assert_eq!(otw.live_len(), 55);
    }

    #[test]
    fn test_leading_silence_is_skipped() {
        let reference = cycle(5, 20);
        let silence = ndarray::Array1::<f32>::zeros(5);
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(4)).unwrap();
        for _ in 0..6 {
            assert_eq!(otw.insert(silence.view()), Some(0));
        }
        for t in 0..20 {
            assert_eq!(otw.insert(reference.column(t)), Some(t));
        }
    }

    #[test]
    fn test_silence_in_both_sequences_is_matched() {
        let mut reference = cycle(6, 30);
        reference
            .slice_mut(ndarray::s![.., 10..16])
            .fill(1.0 / 6f32.sqrt());
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(4)).unwrap();
        for t in 0..30 {
            assert_eq!(otw.insert(reference.column(t)), Some(t));
        }
    }

    #[test]
    fn test_path_steps_are_unit() {
        let reference = cycle(5, 30);
        let live = cycle(5, 45);
        let mut otw = OnlineTimeWarping::new(reference, params(3)).unwrap();
        for t in 0..45 {
            otw.insert(live.column(t));
        }
        let path = otw.path();
        assert_eq!(path[0], (0, 0));
        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(b.0 >= a.0 && b.1 >= a.1);
            assert!(b.0 - a.0 <= 1 && b.1 - a.1 <= 1);
            assert!(b != a);
        }
        assert_eq!(path.last().unwrap().0, otw.estimate());
    }

    #[test]
    fn test_estimates_are_monotone() {
        let reference = cycle(6, 20);
        let mut otw = OnlineTimeWarping::new(reference, params(3)).unwrap();
        let noise = cycle(6, 60);
        let mut last = 0;
        for t in 0..60 {
            // shuffle the live order to provoke disagreement
            let j = otw.insert(noise.column((t * 7) % 60)).unwrap();
            assert!(j >= last);
            last = j;
        }
    }

    #[test]
    fn test_full_live_sequence_returns_none() {
        let reference = cycle(3, 2);
        let mut otw = OnlineTimeWarping::new(
            reference.clone(),
            OtwParams {
                max_live_ratio: 2,
                ..params(1)
            },
        )
        .unwrap();
        for t in 0..4 {
            assert!(otw.insert(reference.column(t % 2)).is_some());
        }
        assert!(otw.is_full());
        assert_eq!(otw.insert(reference.column(0)), None);
        assert_eq!(otw.live_len(), 4);
    }

    #[test]
    fn test_saturates_at_end_of_reference() {
        let reference = cycle(4, 8);
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(2)).unwrap();
        let mut j = 0;
        for t in 0..30 {
            j = otw.insert(reference.column(t % 8)).unwrap();
        }
        assert_eq!(j, 7);
        assert!(otw.at_end_of_reference());
    }

    #[test]
    fn test_single_frame_reference() {
        let reference = cycle(2, 1);
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(10)).unwrap();
        for _ in 0..4 {
            assert_eq!(otw.insert(reference.column(0)), Some(0));
        }
        assert_eq!(otw.insert(reference.column(0)), None);
    }

    #[test]
    fn test_search_width_at_least_reference_length() {
        let reference = cycle(5, 5);
        for c in [5, 8] {
            let mut otw = OnlineTimeWarping::new(reference.clone(), params(c)).unwrap();
            let estimates: Vec<usize> = (0..8)
                .map(|t| otw.insert(reference.column(t.min(4))).unwrap())
                .collect();
            assert_eq!(estimates, vec![0, 1, 2, 3, 4, 4, 4, 4]);
            assert_eq!(&otw.path()[..4], &[(0, 0), (1, 1), (2, 2), (3, 3)]);
        }
    }

    #[test]
    fn test_backtrack_recovers_diagonal() {
        let reference = cycle(7, 30);
        let mut otw = OnlineTimeWarping::new(reference.clone(), params(4)).unwrap();
        for t in 0..20 {
            otw.insert(reference.column(t));
        }
        let back = otw.backtrack(5);
        assert_eq!(*back.last().unwrap(), (otw.reference_index(), 19));
        assert!(back.first().unwrap().0 + 5 >= otw.reference_index());
        for pair in back.windows(2) {
            assert!(pair[1].0 >= pair[0].0 && pair[1].1 >= pair[0].1);
        }
        let full = otw.backtrack(usize::MAX);
        assert_eq!(full[0], (0, 0));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let reference = cycle(3, 5);
        assert!(OnlineTimeWarping::new(reference.clone(), params(0)).is_err());
        let bad = OtwParams {
            max_run_count: 1,
            ..OtwParams::default()
        };
        assert!(OnlineTimeWarping::new(reference.clone(), bad).is_err());
        assert!(OnlineTimeWarping::new(Array2::zeros((12, 0)), OtwParams::default()).is_err());
    }
}
