//! Deterministic accumulation primitives.
//!
//! Every sum that feeds a merged intensity or a figure of merit goes
//! through compensated (Kahan) summation so results are identical across
//! runs and thread counts for a fixed input order.

/// Kahan compensated sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum
    }
}

/// Weighted mean with spread, accumulated incrementally.
#[derive(Debug, Clone, Default)]
pub struct WeightedMean {
    sum_wx: KahanSum,
    sum_wxx: KahanSum,
    sum_w: KahanSum,
    n: usize,
}

impl WeightedMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, x: f64, w: f64) {
        self.sum_wx.add(w * x);
        self.sum_wxx.add(w * x * x);
        self.sum_w.add(w);
        self.n += 1;
    }

    pub fn count(&self) -> usize {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.sum_wx.value() / self.sum_w.value()
    }

    /// Standard error of the weighted mean, estimated from the spread of
    /// the contributing observations. Defined for two or more observations.
    pub fn std_error(&self) -> Option<f64> {
        if self.n < 2 {
            return None;
        }
        let mean = self.mean();
        // sum_w * variance-of-mean = sum w (x - mean)^2 / (n - 1)
        let spread = self.sum_wxx.value() - 2.0 * mean * self.sum_wx.value()
            + mean * mean * self.sum_w.value();
        let var = spread.max(0.0) / ((self.n - 1) as f64 * self.sum_w.value());
        Some(var.sqrt())
    }
}

/// Pearson correlation accumulator. The component sums are additive, so
/// per-shell accumulators can be folded into an overall one.
#[derive(Debug, Clone, Default)]
pub struct PearsonAccum {
    n: usize,
    sum_x: KahanSum,
    sum_y: KahanSum,
    sum_xx: KahanSum,
    sum_yy: KahanSum,
    sum_xy: KahanSum,
}

impl PearsonAccum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, x: f64, y: f64) {
        self.n += 1;
        self.sum_x.add(x);
        self.sum_y.add(y);
        self.sum_xx.add(x * x);
        self.sum_yy.add(y * y);
        self.sum_xy.add(x * y);
    }

    pub fn merge(&mut self, other: &PearsonAccum) {
        self.n += other.n;
        self.sum_x.add(other.sum_x.value());
        self.sum_y.add(other.sum_y.value());
        self.sum_xx.add(other.sum_xx.value());
        self.sum_yy.add(other.sum_yy.value());
        self.sum_xy.add(other.sum_xy.value());
    }

    pub fn count(&self) -> usize {
        self.n
    }

    pub fn correlation(&self) -> Option<f64> {
        if self.n < 2 {
            return None;
        }
        let n = self.n as f64;
        let cov = self.sum_xy.value() - self.sum_x.value() * self.sum_y.value() / n;
        let var_x = self.sum_xx.value() - self.sum_x.value().powi(2) / n;
        let var_y = self.sum_yy.value() - self.sum_y.value().powi(2) / n;
        let denom = (var_x * var_y).sqrt();
        if denom <= 0.0 {
            return None;
        }
        Some(cov / denom)
    }
}

/// Mean/variance accumulator (unweighted), additive across shells.
#[derive(Debug, Clone, Default)]
pub struct VarianceAccum {
    n: usize,
    sum: KahanSum,
    sum_sq: KahanSum,
}

impl VarianceAccum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, x: f64) {
        self.n += 1;
        self.sum.add(x);
        self.sum_sq.add(x * x);
    }

    pub fn merge(&mut self, other: &VarianceAccum) {
        self.n += other.n;
        self.sum.add(other.sum.value());
        self.sum_sq.add(other.sum_sq.value());
    }

    pub fn count(&self) -> usize {
        self.n
    }

    /// Population variance; None below two samples.
    pub fn variance(&self) -> Option<f64> {
        if self.n < 2 {
            return None;
        }
        let n = self.n as f64;
        Some((self.sum_sq.value() - self.sum.value().powi(2) / n).max(0.0) / n)
    }
}

/// Ordinary least squares for y = intercept + slope·x.
/// Returns None with fewer than two points or a degenerate x spread.
pub fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mut sx = KahanSum::new();
    let mut sy = KahanSum::new();
    let mut sxx = KahanSum::new();
    let mut sxy = KahanSum::new();
    for &(x, y) in points {
        sx.add(x);
        sy.add(y);
        sxx.add(x * x);
        sxy.add(x * y);
    }
    let denom = n * sxx.value() - sx.value() * sx.value();
    if denom.abs() < f64::EPSILON * n * sxx.value().abs().max(1.0) {
        return None;
    }
    let slope = (n * sxy.value() - sx.value() * sy.value()) / denom;
    let intercept = (sy.value() - slope * sx.value()) / n;
    Some((intercept, slope))
}
