use crate::core::cell::UnitCell;
use crate::core::symmetry::SymOpList;
use crate::math::stats::KahanSum;
use nalgebra::Vector3;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// MILLER INDICES
// ============================================================================

/// A signed Miller index triple. The derived ordering is lexicographic over
/// (h, k, l); it defines both the `ReflList` iteration order and the choice
/// of asymmetric-unit representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Miller {
    pub h: i32,
    pub k: i32,
    pub l: i32,
}

impl Miller {
    pub fn new(h: i32, k: i32, l: i32) -> Self {
        Self { h, k, l }
    }

    /// The Friedel mate (-h,-k,-l).
    pub fn friedel(self) -> Self {
        Self::new(-self.h, -self.k, -self.l)
    }
}

impl fmt::Display for Miller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.h, self.k, self.l)
    }
}

// ============================================================================
// REFLECTION RECORDS
// ============================================================================

/// One stored reflection: a measured (or merged) intensity with its
/// bookkeeping fields.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub intensity: f64,
    pub sigma: f64,
    /// Fraction of the full intensity captured this shot, in [0, 1].
    pub partiality: f64,
    /// Geometric Lorentz factor; 1.0 unless the loader supplies one.
    pub lorentz: f64,
    /// Number of observations that contributed to this record.
    pub redundancy: u32,
    pub scalable: bool,
    pub refinable: bool,
    /// Observed detector position (fast-scan, slow-scan), in pixels.
    pub fs: f64,
    pub ss: f64,
}

impl Default for Reflection {
    fn default() -> Self {
        Self {
            intensity: 0.0,
            sigma: 0.0,
            partiality: 1.0,
            lorentz: 1.0,
            redundancy: 1,
            scalable: true,
            refinable: false,
            fs: 0.0,
            ss: 0.0,
        }
    }
}

// ============================================================================
// REFLECTION LIST
// ============================================================================

/// An ordered map from Miller indices to reflections.
///
/// Backed by a `BTreeMap`, which gives O(log n) insert/lookup and
/// deterministic in-order iteration keyed by the lexicographic Miller
/// ordering. Lookup is exact: no symmetry folding happens here, callers
/// fold indices first when they want asymmetric-unit semantics.
#[derive(Debug, Clone, Default)]
pub struct ReflList {
    map: BTreeMap<Miller, Reflection>,
}

impl ReflList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-insert: returns the existing reflection for `hkl`, creating a
    /// default one when absent. (The reference implementation split this
    /// into insert-always plus a separate find; the entry API collapses the
    /// two while keeping the no-duplicate-keys invariant.)
    pub fn add(&mut self, hkl: Miller) -> &mut Reflection {
        self.map.entry(hkl).or_default()
    }

    /// Inserts `refl` under `hkl`, replacing any existing record.
    pub fn insert(&mut self, hkl: Miller, refl: Reflection) {
        self.map.insert(hkl, refl);
    }

    pub fn find(&self, hkl: Miller) -> Option<&Reflection> {
        self.map.get(&hkl)
    }

    pub fn find_mut(&mut self, hkl: Miller) -> Option<&mut Reflection> {
        self.map.get_mut(&hkl)
    }

    pub fn contains(&self, hkl: Miller) -> bool {
        self.map.contains_key(&hkl)
    }

    pub fn remove(&mut self, hkl: Miller) -> Option<Reflection> {
        self.map.remove(&hkl)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// In-order iteration over (index, reflection) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Miller, &Reflection)> {
        self.map.iter().map(|(hkl, r)| (*hkl, r))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Miller, &mut Reflection)> {
        self.map.iter_mut().map(|(hkl, r)| (*hkl, r))
    }

    /// The stored Miller indices, in iteration order.
    pub fn indices(&self) -> Vec<Miller> {
        self.map.keys().copied().collect()
    }
}

// ============================================================================
// FOLDING AND CORRECTIONS
// ============================================================================

/// Rebuilds a reflection list keyed by the asymmetric-unit representative
/// of each index. Symmetry-equivalent observations collapse into a single
/// entry holding their redundancy-weighted mean intensity, quadrature-pooled
/// sigma, and summed redundancy. Folding an already-asymmetric list is a
/// no-op.
pub fn fold_to_asymmetric(list: &ReflList, sym: &SymOpList) -> ReflList {
    struct Accum {
        sum_wi: KahanSum,
        sum_wp: KahanSum,
        sum_w: f64,
        sum_sigma_sq: KahanSum,
        redundancy: u32,
        first: Reflection,
    }

    let mut groups: BTreeMap<Miller, Accum> = BTreeMap::new();

    for (hkl, refl) in list.iter() {
        let asym = sym.asymmetric(hkl);
        let w = refl.redundancy.max(1) as f64;
        let entry = groups.entry(asym).or_insert_with(|| Accum {
            sum_wi: KahanSum::new(),
            sum_wp: KahanSum::new(),
            sum_w: 0.0,
            sum_sigma_sq: KahanSum::new(),
            redundancy: 0,
            first: refl.clone(),
        });
        entry.sum_wi.add(w * refl.intensity);
        entry.sum_wp.add(w * refl.partiality);
        entry.sum_w += w;
        entry.sum_sigma_sq.add((w * refl.sigma).powi(2));
        entry.redundancy += refl.redundancy.max(1);
    }

    let mut folded = ReflList::new();
    for (asym, acc) in groups {
        let mut refl = acc.first;
        refl.intensity = acc.sum_wi.value() / acc.sum_w;
        refl.partiality = acc.sum_wp.value() / acc.sum_w;
        refl.sigma = acc.sum_sigma_sq.value().sqrt() / acc.sum_w;
        refl.redundancy = acc.redundancy;
        folded.insert(asym, refl);
    }
    folded
}

/// Divides every intensity (and sigma) by the dipole polarisation factor
/// for its scattering direction.
///
/// The outgoing unit vector for a reflection at reciprocal position r is
/// s = (r + k ez)/|r + k ez| with k = 1/lambda; a beam with horizontal
/// polarisation fraction `fraction` gives
/// P = fraction·(1 - s_x^2) + (1 - fraction)·(1 - s_y^2).
/// 0.5 is an unpolarised beam. Applied exactly once, before the first
/// scaling pass.
pub fn polarisation_correct(
    list: &mut ReflList,
    cell: &UnitCell,
    wavelength: f64,
    fraction: f64,
) {
    let k = 1.0 / wavelength;
    for (hkl, refl) in list.iter_mut() {
        let r = cell.scattering_vector(hkl);
        let out = Vector3::new(r.x, r.y, r.z + k);
        let s = out / out.norm();
        let p = fraction * (1.0 - s.x * s.x) + (1.0 - fraction) * (1.0 - s.y * s.y);
        // P reaches zero only for scattering straight along the polarisation
        // axis, which no crystal reflection from a forward detector does.
        if p > 1e-9 {
            refl.intensity /= p;
            refl.sigma /= p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symmetry::SymOpList;
    use approx::assert_relative_eq;

    fn seeded_list() -> ReflList {
        let mut list = ReflList::new();
        for (h, k, l, i) in [(1, 0, 0, 10.0), (-1, 0, 0, 20.0), (0, 2, 0, 30.0)] {
            let refl = list.add(Miller::new(h, k, l));
            refl.intensity = i;
            refl.sigma = 1.0;
        }
        list
    }

    #[test]
    fn add_is_get_or_insert() {
        let mut list = ReflList::new();
        list.add(Miller::new(1, 2, 3)).intensity = 5.0;
        assert_eq!(list.len(), 1);
        // Second add returns the same record.
        assert_relative_eq!(list.add(Miller::new(1, 2, 3)).intensity, 5.0);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn iteration_is_ordered() {
        let list = seeded_list();
        let keys = list.indices();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn folding_merges_equivalents() {
        let sym = SymOpList::from_name("-1").unwrap();
        let list = seeded_list();
        let folded = fold_to_asymmetric(&list, &sym);

        // (1,0,0) and (-1,0,0) collapse onto (1,0,0).
        let merged = folded.find(Miller::new(1, 0, 0)).unwrap();
        assert_relative_eq!(merged.intensity, 15.0);
        assert_eq!(merged.redundancy, 2);
        assert!(folded.find(Miller::new(-1, 0, 0)).is_none());

        // Every original index is reachable through its representative.
        for (hkl, _) in list.iter() {
            assert!(folded.contains(sym.asymmetric(hkl)));
        }
    }

    #[test]
    fn folding_is_idempotent() {
        let sym = SymOpList::from_name("mmm").unwrap();
        let folded = fold_to_asymmetric(&seeded_list(), &sym);
        let refolded = fold_to_asymmetric(&folded, &sym);

        assert_eq!(folded.len(), refolded.len());
        for (hkl, refl) in folded.iter() {
            let again = refolded.find(hkl).unwrap();
            assert_relative_eq!(refl.intensity, again.intensity);
            assert_eq!(refl.redundancy, again.redundancy);
        }
    }

    #[test]
    fn polarisation_factor_bounds() {
        let cell = UnitCell::from_parameters(4.0e-9, 4.0e-9, 4.0e-9, 90.0, 90.0, 90.0).unwrap();
        let mut list = ReflList::new();
        for h in 1..6 {
            let refl = list.add(Miller::new(h, h - 1, 1));
            refl.intensity = 100.0;
            refl.sigma = 1.0;
        }
        polarisation_correct(&mut list, &cell, 1.3e-10, 0.5);
        // Dividing by a factor in (0, 1] can only keep or raise intensities.
        for (_, refl) in list.iter() {
            assert!(refl.intensity >= 100.0);
            assert!(refl.intensity < 300.0);
        }
    }
}
