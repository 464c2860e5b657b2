/// One contiguous run of written rows in a live column.
#[derive(Debug, Clone, Default)]
struct Band {
    start: usize,
    values: Vec<f32>,
}

impl Band {
    fn end(&self) -> usize {
        self.start + self.values.len()
    }
}

/// Accumulated-cost matrix `D[j, t]` of the online aligner.
///
/// Logically `rows × capacity`, every cell `+∞` until written. Only a narrow
/// diagonal band is ever written, so each live column stores just the
/// contiguous run of rows written into it, and each row remembers the range
/// of columns it touched. Reads outside what was written return `+∞`.
#[derive(Debug, Clone)]
pub struct CostMatrix {
    rows: usize,
    capacity: usize,
    columns: Vec<Band>,
    row_span: Vec<Option<(usize, usize)>>,
}

impl CostMatrix {
    pub fn new(rows: usize, capacity: usize) -> Self {
        Self {
            rows,
            capacity,
            columns: Vec::new(),
            row_span: vec![None; rows],
        }
    }

    /// Number of reference rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Maximum number of live columns.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cells actually stored (including `+∞` gap fillers).
    pub fn stored_cells(&self) -> usize {
        self.columns.iter().map(|b| b.values.len()).sum()
    }

    /// Read `D[j, t]`; `+∞` for anything never written.
    pub fn get(&self, j: usize, t: usize) -> f32 {
        match self.columns.get(t) {
            Some(band) if j >= band.start && j < band.end() => band.values[j - band.start],
            _ => f32::INFINITY,
        }
    }

    /// Write `D[j, t]`. Writes outside `rows × capacity` are ignored.
    pub fn set(&mut self, j: usize, t: usize, value: f32) {
        if j >= self.rows || t >= self.capacity {
            log::warn!(
                "CostMatrix::set: ({}, {}) outside {}x{}",
                j,
                t,
                self.rows,
                self.capacity
            );
            return;
        }
        if self.columns.len() <= t {
            self.columns.resize_with(t + 1, Band::default);
        }
        let band = &mut self.columns[t];
        if band.values.is_empty() {
            band.start = j;
            band.values.push(value);
        } else if j < band.start {
            let gap = band.start - j;
            let mut values = Vec::with_capacity(band.values.len() + gap);
            values.push(value);
            values.extend(std::iter::repeat_n(f32::INFINITY, gap - 1));
            values.append(&mut band.values);
            band.values = values;
            band.start = j;
        } else if j < band.end() {
            band.values[j - band.start] = value;
        } else {
            let gap = j - band.end();
            band.values.extend(std::iter::repeat_n(f32::INFINITY, gap));
            band.values.push(value);
        }

        self.row_span[j] = Some(match self.row_span[j] {
            Some((first, last)) => (first.min(t), last.max(t)),
            None => (t, t),
        });
    }

    /// Index of the cheapest cell of row `j` among columns `0..=t`.
    ///
    /// Ties go to the highest index (nearest the frontier). Returns 0 when
    /// the whole range is `+∞`.
    pub fn row_argmin(&self, j: usize, t: usize) -> usize {
        let Some(&Some((first, last))) = self.row_span.get(j) else {
            return 0;
        };
        if first > t {
            return 0;
        }
        last_argmin((first..=last.min(t)).map(|k| (k, self.get(j, k))))
    }

    /// Index of the cheapest cell of column `t` among rows `0..=j`, ties
    /// going to the highest row.
    pub fn col_argmin(&self, j: usize, t: usize) -> usize {
        let Some(band) = self.columns.get(t) else {
            return 0;
        };
        if band.values.is_empty() || band.start > j {
            return 0;
        }
        let last = (band.end() - 1).min(j);
        last_argmin((band.start..=last).map(|k| (k, band.values[k - band.start])))
    }
}

fn last_argmin(cells: impl Iterator<Item = (usize, f32)>) -> usize {
    let mut best = (0, f32::INFINITY);
    for (idx, value) in cells {
        if value.is_finite() && value <= best.1 {
            best = (idx, value);
        }
    }
    best.0
}
