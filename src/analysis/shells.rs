use crate::error::MergeError;

/// An ordered partition of a resolution range [d*min, d*max] into bins of
/// equal reciprocal volume.
///
/// Equal volume, not equal width: with v = (d*max^3 - d*min^3)/n, shell i
/// spans [(d*min^3 + i·v)^(1/3), (d*min^3 + (i+1)·v)^(1/3)]. This puts a
/// comparable number of reflections in every shell. A d* exactly on an
/// interior boundary belongs to the lower-index shell.
#[derive(Debug, Clone)]
pub struct ResolutionShells {
    /// n+1 ascending boundary values in 1/m.
    bounds: Vec<f64>,
}

impl ResolutionShells {
    pub fn new(dstar_min: f64, dstar_max: f64, n: usize) -> Result<Self, MergeError> {
        if n == 0 {
            return Err(MergeError::Input("at least one resolution shell".into()));
        }
        if !(dstar_min >= 0.0 && dstar_max > dstar_min) {
            return Err(MergeError::Input(format!(
                "invalid resolution range {} .. {}",
                dstar_min, dstar_max
            )));
        }

        let lo3 = dstar_min.powi(3);
        let v = (dstar_max.powi(3) - lo3) / n as f64;
        let mut bounds: Vec<f64> = (0..=n).map(|i| (lo3 + i as f64 * v).cbrt()).collect();
        // Guard against cbrt rounding at the extremes.
        bounds[0] = dstar_min;
        bounds[n] = dstar_max;

        Ok(Self { bounds })
    }

    /// Covering shells for a reflection list's resolution span is a common
    /// need; this derives the range from an iterator of d* values.
    pub fn covering(dstars: impl Iterator<Item = f64>, n: usize) -> Result<Self, MergeError> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for d in dstars {
            lo = lo.min(d);
            hi = hi.max(d);
        }
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            return Err(MergeError::Input(
                "cannot derive a resolution range from the data".into(),
            ));
        }
        Self::new(lo, hi, n)
    }

    pub fn count(&self) -> usize {
        self.bounds.len() - 1
    }

    /// (low, high) d* bounds of shell i.
    pub fn bounds(&self, i: usize) -> (f64, f64) {
        (self.bounds[i], self.bounds[i + 1])
    }

    /// Midpoint d* of shell i, used for labelling report rows.
    pub fn centre(&self, i: usize) -> f64 {
        0.5 * (self.bounds[i] + self.bounds[i + 1])
    }

    pub fn dstar_min(&self) -> f64 {
        self.bounds[0]
    }

    pub fn dstar_max(&self) -> f64 {
        *self.bounds.last().unwrap()
    }

    /// Shell index for a d* value, or None outside the covered range.
    /// Interior boundaries resolve to the lower-index shell; the lower
    /// limit itself belongs to shell 0.
    pub fn index_of(&self, dstar: f64) -> Option<usize> {
        if dstar < self.dstar_min() || dstar > self.dstar_max() {
            return None;
        }
        if dstar == self.dstar_min() {
            return Some(0);
        }
        // Number of interior boundaries strictly below dstar.
        let idx = self.bounds[1..].partition_point(|b| *b < dstar);
        Some(idx.min(self.count() - 1))
    }
}
