/// Centres (seconds) of the five input sets: very negative, negative, zero,
/// positive, very positive timing error.
const INPUT_CENTRES: [f32; 5] = [-1.5, -0.75, 0.0, 0.75, 1.5];
const RESOLUTION: usize = 201;

/// Mamdani fuzzy rate controller.
///
/// Five triangular input sets over the timing error map one-to-one onto five
/// output sets, reversed: a very negative error (accompaniment far behind)
/// fires "very fast", a very positive one fires "very slow". Output sets are
/// laid out symmetrically in log-rate between `1/m` and `m`, so zero error
/// yields exactly rate 1. Min implication, max aggregation, centroid
/// defuzzification over a discretized universe.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyController {
    limits: (f32, f32),
    universe: Vec<f32>,
    output_sets: [Vec<f32>; 5],
}

impl FuzzyController {
    pub fn new(limits: (f32, f32)) -> Self {
        let lo = limits.0.max(f32::MIN_POSITIVE).ln();
        let hi = limits.1.max(limits.0).ln();
        let universe: Vec<f32> = (0..RESOLUTION)
            .map(|i| lo + (hi - lo) * i as f32 / (RESOLUTION - 1) as f32)
            .collect();
        let centres = [lo, lo / 2.0, 0.0, hi / 2.0, hi];
        let output_sets = std::array::from_fn(|i| {
            universe
                .iter()
                .map(|&y| triangle(y, &centres, i))
                .collect()
        });
        Self {
            limits,
            universe,
            output_sets,
        }
    }

    /// Degree to which `error` belongs to each input set.
    pub fn memberships(error: f32) -> [f32; 5] {
        std::array::from_fn(|i| triangle(error, &INPUT_CENTRES, i))
    }

    pub fn update(&self, error: f32) -> f32 {
        let firing = Self::memberships(error);
        let mut weighted = 0.0f32;
        let mut total = 0.0f32;
        for (k, &y) in self.universe.iter().enumerate() {
            let mu = firing
                .iter()
                .enumerate()
                .map(|(i, &alpha)| alpha.min(self.output_sets[4 - i][k]))
                .fold(0.0f32, f32::max);
            weighted += mu * y;
            total += mu;
        }
        let rate = if total > 0.0 {
            (weighted / total).exp()
        } else {
            1.0
        };
        rate.clamp(self.limits.0, self.limits.1)
    }
}

/// Membership of `x` in set `i` of a row of triangular sets with the given
/// peaks. The first and last sets are shoulders that stay at 1 beyond their
/// peak.
fn triangle(x: f32, centres: &[f32; 5], i: usize) -> f32 {
    let c = centres[i];
    if x <= c {
        if i == 0 {
            return 1.0;
        }
        let left = centres[i - 1];
        if x <= left || c <= left {
            return 0.0;
        }
        (x - left) / (c - left)
    } else {
        if i == centres.len() - 1 {
            return 1.0;
        }
        let right = centres[i + 1];
        if x >= right || right <= c {
            return 0.0;
        }
        (right - x) / (right - c)
    }
}
