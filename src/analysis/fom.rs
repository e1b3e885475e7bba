use crate::analysis::shells::ResolutionShells;
use crate::core::cell::UnitCell;
use crate::core::reflection::{Miller, ReflList};
use crate::core::symmetry::SymOpList;
use crate::error::MergeError;
use crate::math::stats::{linear_fit, KahanSum, PearsonAccum, VarianceAccum};
use log::debug;
use std::collections::BTreeMap;
use std::f64::consts::SQRT_2;
use std::fmt;

// ============================================================================
// FOM KINDS AND SELECTION POLICY
// ============================================================================

/// The figure-of-merit families computed over a pair of reflection lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FomKind {
    /// Sum |I1-I2| / Sum I1.
    R1I,
    /// Sum |sqrt(I1)-sqrt(I2)| / Sum sqrt(I1).
    R1F,
    /// sqrt( Sum (I1-I2)^2 / Sum I1^2 ).
    R2,
    /// (2/sqrt2) · Sum |I1-I2| / Sum (I1+I2).
    Rsplit,
    /// Pearson correlation of I1 and I2.
    CC,
    /// sqrt( 2CC / (1+CC) ).
    CCstar,
    /// Pearson correlation of the Bijvoet differences.
    CCano,
    /// sqrt( Var((d1+d2)/sqrt2) / Var((d1-d2)/sqrt2) ).
    CRDano,
    /// 2 · Sum |mean - mean_Bijvoet| / Sum (mean + mean_Bijvoet).
    Rano,
    /// Rano over Rsplit, both on the anomalous selection.
    RanoOverRsplit,
    /// Fraction of pairs with |I1-I2| < 1·sqrt(s1^2+s2^2).
    D1Sig,
    /// Fraction of pairs with |I1-I2| < 2·sqrt(s1^2+s2^2).
    D2Sig,
}

impl FomKind {
    /// Anomalous kinds need Bijvoet partners and a point group.
    pub fn needs_anomalous(self) -> bool {
        matches!(
            self,
            FomKind::CCano | FomKind::CRDano | FomKind::Rano | FomKind::RanoOverRsplit
        )
    }

    pub fn from_name(name: &str) -> Result<Self, MergeError> {
        Ok(match name {
            "r1i" => FomKind::R1I,
            "r1f" => FomKind::R1F,
            "r2" => FomKind::R2,
            "rsplit" => FomKind::Rsplit,
            "cc" => FomKind::CC,
            "ccstar" => FomKind::CCstar,
            "ccano" => FomKind::CCano,
            "crdano" => FomKind::CRDano,
            "rano" => FomKind::Rano,
            "rano/rsplit" => FomKind::RanoOverRsplit,
            "d1sig" => FomKind::D1Sig,
            "d2sig" => FomKind::D2Sig,
            other => return Err(MergeError::Input(format!("unknown FOM kind '{}'", other))),
        })
    }
}

impl fmt::Display for FomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FomKind::R1I => "R1(I)",
            FomKind::R1F => "R1(F)",
            FomKind::R2 => "R2",
            FomKind::Rsplit => "Rsplit",
            FomKind::CC => "CC",
            FomKind::CCstar => "CC*",
            FomKind::CCano => "CCano",
            FomKind::CRDano => "CRDano",
            FomKind::Rano => "Rano",
            FomKind::RanoOverRsplit => "Rano/Rsplit",
            FomKind::D1Sig => "D<1sigma",
            FomKind::D2Sig => "D<2sigma",
        };
        write!(f, "{}", name)
    }
}

/// What to do with negative intensities before accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativePolicy {
    /// Keep them (kinds that need square roots skip them individually).
    #[default]
    Keep,
    /// Drop the pair when either intensity is negative.
    Drop,
    /// Clamp negative intensities to zero.
    Zero,
}

/// Pair-selection policy applied before any FOM accumulation.
#[derive(Debug, Clone)]
pub struct FomSelection {
    /// Reject pairs with I < cutoff·sigma in either list.
    pub sigma_cutoff: Option<f64>,
    pub negatives: NegativePolicy,
    /// Reject pairs below this redundancy in either list.
    pub min_redundancy: u32,
    pub dstar_min: Option<f64>,
    pub dstar_max: Option<f64>,
}

impl Default for FomSelection {
    fn default() -> Self {
        Self {
            sigma_cutoff: None,
            negatives: NegativePolicy::Keep,
            min_redundancy: 0,
            dstar_min: None,
            dstar_max: None,
        }
    }
}

// ============================================================================
// WILSON SCALING
// ============================================================================

/// Relative Wilson scale between two lists: I2 is multiplied by
/// scale·exp(2·b_factor·d*^2) to bring it onto I1.
#[derive(Debug, Clone, Copy)]
pub struct WilsonScale {
    pub scale: f64,
    pub b_factor: f64,
}

impl WilsonScale {
    pub fn factor(&self, dstar: f64) -> f64 {
        self.scale * (2.0 * self.b_factor * dstar * dstar).exp()
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct FomShellValue {
    pub dstar_centre: f64,
    pub n: usize,
    pub value: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FomResult {
    pub kind: FomKind,
    pub shells: Vec<FomShellValue>,
    /// Computed from numerators/denominators accumulated across all
    /// shells, not from a mean of per-shell values.
    pub overall: Option<f64>,
    pub n_total: usize,
    pub wilson: Option<WilsonScale>,
}

// ============================================================================
// ACCUMULATION
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Accum {
    n: usize,
    num: KahanSum,
    den: KahanSum,
    num2: KahanSum,
    den2: KahanSum,
    n_within: usize,
    pearson: PearsonAccum,
    var_plus: VarianceAccum,
    var_minus: VarianceAccum,
}

impl Accum {
    fn merge(&mut self, other: &Accum) {
        self.n += other.n;
        self.num.add(other.num.value());
        self.den.add(other.den.value());
        self.num2.add(other.num2.value());
        self.den2.add(other.den2.value());
        self.n_within += other.n_within;
        self.pearson.merge(&other.pearson);
        self.var_plus.merge(&other.var_plus);
        self.var_minus.merge(&other.var_minus);
    }

    fn value(&self, kind: FomKind) -> Option<f64> {
        if self.n == 0 {
            return None;
        }
        match kind {
            FomKind::R1I | FomKind::R1F | FomKind::Rano => {
                let den = self.den.value();
                (den != 0.0).then(|| self.num.value() / den)
            }
            FomKind::R2 => {
                let den = self.den.value();
                (den > 0.0).then(|| (self.num.value() / den).sqrt())
            }
            FomKind::Rsplit => {
                let den = self.den.value();
                (den != 0.0).then(|| (2.0 / SQRT_2) * self.num.value() / den)
            }
            FomKind::CC | FomKind::CCano => self.pearson.correlation(),
            FomKind::CCstar => {
                let cc = self.pearson.correlation()?;
                let ratio = 2.0 * cc / (1.0 + cc);
                (ratio >= 0.0).then(|| ratio.sqrt())
            }
            FomKind::CRDano => {
                let vp = self.var_plus.variance()?;
                let vm = self.var_minus.variance()?;
                (vm > 0.0).then(|| (vp / vm).sqrt())
            }
            FomKind::RanoOverRsplit => {
                let rano_den = self.den.value();
                let rsplit_den = self.den2.value();
                if rano_den == 0.0 || rsplit_den == 0.0 {
                    return None;
                }
                let rano = self.num.value() / rano_den;
                let rsplit = (2.0 / SQRT_2) * self.num2.value() / rsplit_den;
                (rsplit != 0.0).then(|| rano / rsplit)
            }
            FomKind::D1Sig | FomKind::D2Sig => Some(self.n_within as f64 / self.n as f64),
        }
    }
}

/// One selected common reflection.
#[derive(Debug, Clone, Copy)]
struct Pair {
    hkl: Miller,
    shell: usize,
    dstar: f64,
    i1: f64,
    s1: f64,
    i2: f64,
    s2: f64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Computes one figure of merit over the reflections common to two lists,
/// binned into the given resolution shells.
///
/// Both lists must already be reduced to the same asymmetric domain. The
/// point group is required only for the anomalous kinds, where Bijvoet
/// partners are located through it and centric reflections are excluded.
/// Unless `apply_wilson` is false, list 2 is brought onto list 1's scale
/// by a Wilson fit before accumulation.
pub fn compute_fom(
    list1: &ReflList,
    list2: &ReflList,
    cell: &UnitCell,
    shells: &ResolutionShells,
    kind: FomKind,
    sym: Option<&SymOpList>,
    selection: &FomSelection,
    apply_wilson: bool,
) -> Result<FomResult, MergeError> {
    let mut pairs = select_pairs(list1, list2, cell, shells, selection);

    let wilson = if apply_wilson {
        let fit = wilson_fit(&pairs)?;
        for pair in pairs.iter_mut() {
            let factor = fit.factor(pair.dstar);
            pair.i2 *= factor;
            pair.s2 *= factor;
        }
        Some(fit)
    } else {
        None
    };

    let mut accums = vec![Accum::default(); shells.count()];
    if kind.needs_anomalous() {
        let sym = sym.ok_or_else(|| {
            MergeError::Input("anomalous figures of merit need a point group".into())
        })?;
        accumulate_anomalous(&pairs, sym, kind, &mut accums);
    } else {
        accumulate_plain(&pairs, kind, &mut accums);
    }

    // The overall value folds the per-shell sums, so shell numerators add
    // up to the overall numerator by construction.
    let mut overall = Accum::default();
    for acc in &accums {
        overall.merge(acc);
    }

    let shell_values = accums
        .iter()
        .enumerate()
        .map(|(i, acc)| FomShellValue {
            dstar_centre: shells.centre(i),
            n: acc.n,
            value: acc.value(kind),
        })
        .collect();

    Ok(FomResult {
        kind,
        shells: shell_values,
        overall: overall.value(kind),
        n_total: overall.n,
        wilson,
    })
}

fn select_pairs(
    list1: &ReflList,
    list2: &ReflList,
    cell: &UnitCell,
    shells: &ResolutionShells,
    selection: &FomSelection,
) -> Vec<Pair> {
    let mut pairs = Vec::new();

    for (hkl, r1) in list1.iter() {
        let r2 = match list2.find(hkl) {
            Some(r) => r,
            None => continue,
        };

        if r1.redundancy < selection.min_redundancy || r2.redundancy < selection.min_redundancy {
            continue;
        }
        if let Some(cutoff) = selection.sigma_cutoff {
            if r1.intensity < cutoff * r1.sigma || r2.intensity < cutoff * r2.sigma {
                continue;
            }
        }

        let mut i1 = r1.intensity;
        let mut i2 = r2.intensity;
        match selection.negatives {
            NegativePolicy::Keep => {}
            NegativePolicy::Drop => {
                if i1 < 0.0 || i2 < 0.0 {
                    continue;
                }
            }
            NegativePolicy::Zero => {
                i1 = i1.max(0.0);
                i2 = i2.max(0.0);
            }
        }

        let dstar = cell.resolution(hkl);
        if let Some(lo) = selection.dstar_min {
            if dstar < lo {
                continue;
            }
        }
        if let Some(hi) = selection.dstar_max {
            if dstar > hi {
                continue;
            }
        }
        let shell = match shells.index_of(dstar) {
            Some(s) => s,
            None => continue,
        };

        pairs.push(Pair {
            hkl,
            shell,
            dstar,
            i1,
            s1: r1.sigma,
            i2,
            s2: r2.sigma,
        });
    }
    pairs
}

/// Fits log(I1/I2) = log G + 2B·d*^2 over the common pairs with positive
/// intensities in both lists.
fn wilson_fit(pairs: &[Pair]) -> Result<WilsonScale, MergeError> {
    let points: Vec<(f64, f64)> = pairs
        .iter()
        .filter(|p| p.i1 > 0.0 && p.i2 > 0.0)
        .map(|p| (p.dstar * p.dstar, (p.i1 / p.i2).ln()))
        .collect();

    if points.len() < 2 {
        return Err(MergeError::ScalingFailed(format!(
            "Wilson fit needs at least 2 usable pairs, have {}",
            points.len()
        )));
    }
    let (intercept, slope) = linear_fit(&points).ok_or_else(|| {
        MergeError::ScalingFailed("Wilson fit is singular (no d* spread)".into())
    })?;

    let fit = WilsonScale {
        scale: intercept.exp(),
        b_factor: slope / 2.0,
    };
    debug!(
        "Wilson fit over {} pairs: G = {:.4e}, B = {:.4e}",
        points.len(),
        fit.scale,
        fit.b_factor
    );
    Ok(fit)
}

fn accumulate_plain(pairs: &[Pair], kind: FomKind, accums: &mut [Accum]) {
    for pair in pairs {
        let acc = &mut accums[pair.shell];
        match kind {
            FomKind::R1I => {
                acc.n += 1;
                acc.num.add((pair.i1 - pair.i2).abs());
                acc.den.add(pair.i1);
            }
            FomKind::R1F => {
                // Square roots need non-negative intensities; with the Keep
                // policy, negative pairs are skipped for this kind only.
                if pair.i1 < 0.0 || pair.i2 < 0.0 {
                    continue;
                }
                acc.n += 1;
                let f1 = pair.i1.sqrt();
                acc.num.add((f1 - pair.i2.sqrt()).abs());
                acc.den.add(f1);
            }
            FomKind::R2 => {
                acc.n += 1;
                acc.num.add((pair.i1 - pair.i2).powi(2));
                acc.den.add(pair.i1 * pair.i1);
            }
            FomKind::Rsplit => {
                acc.n += 1;
                acc.num.add((pair.i1 - pair.i2).abs());
                acc.den.add(pair.i1 + pair.i2);
            }
            FomKind::CC | FomKind::CCstar => {
                acc.n += 1;
                acc.pearson.add(pair.i1, pair.i2);
            }
            FomKind::D1Sig | FomKind::D2Sig => {
                let k = if kind == FomKind::D1Sig { 1.0 } else { 2.0 };
                acc.n += 1;
                let pooled = (pair.s1 * pair.s1 + pair.s2 * pair.s2).sqrt();
                if (pair.i1 - pair.i2).abs() < k * pooled {
                    acc.n_within += 1;
                }
            }
            FomKind::CCano | FomKind::CRDano | FomKind::Rano | FomKind::RanoOverRsplit => {
                unreachable!("anomalous kinds use accumulate_anomalous")
            }
        }
    }
}

fn accumulate_anomalous(pairs: &[Pair], sym: &SymOpList, kind: FomKind, accums: &mut [Accum]) {
    let by_hkl: BTreeMap<Miller, &Pair> = pairs.iter().map(|p| (p.hkl, p)).collect();

    for pair in pairs {
        // Each Bijvoet pair is visited once, from its lesser member. The
        // partner must itself have survived selection in both lists, and
        // centric reflections carry no anomalous signal.
        let partner_hkl = sym.asymmetric(pair.hkl.friedel());
        if partner_hkl <= pair.hkl || sym.is_centric(pair.hkl) {
            continue;
        }
        let partner = match by_hkl.get(&partner_hkl) {
            Some(p) => *p,
            None => continue,
        };

        let acc = &mut accums[pair.shell];
        let d1 = pair.i1 - partner.i1;
        let d2 = pair.i2 - partner.i2;

        match kind {
            FomKind::CCano => {
                acc.n += 1;
                acc.pearson.add(d1, d2);
            }
            FomKind::CRDano => {
                acc.n += 1;
                acc.var_plus.add((d1 + d2) / SQRT_2);
                acc.var_minus.add((d1 - d2) / SQRT_2);
            }
            FomKind::Rano => {
                acc.n += 1;
                let mean = (pair.i1 + pair.i2) / 2.0;
                let mean_bij = (partner.i1 + partner.i2) / 2.0;
                acc.num.add(2.0 * (mean - mean_bij).abs());
                acc.den.add(mean + mean_bij);
            }
            FomKind::RanoOverRsplit => {
                acc.n += 1;
                let mean = (pair.i1 + pair.i2) / 2.0;
                let mean_bij = (partner.i1 + partner.i2) / 2.0;
                acc.num.add(2.0 * (mean - mean_bij).abs());
                acc.den.add(mean + mean_bij);
                // Rsplit over the same selection: both pair members count.
                acc.num2.add((pair.i1 - pair.i2).abs());
                acc.num2.add((partner.i1 - partner.i2).abs());
                acc.den2.add(pair.i1 + pair.i2);
                acc.den2.add(partner.i1 + partner.i2);
            }
            _ => unreachable!("plain kinds use accumulate_plain"),
        }
    }
}

// ============================================================================
// DATASET STATISTICS
// ============================================================================

/// Per-shell summary of a single merged list: unique reflections,
/// observations, redundancy, signal, and completeness against the ideal
/// reflection count for the shell.
#[derive(Debug, Clone)]
pub struct ShellStats {
    pub dstar_centre: f64,
    pub n_unique: usize,
    pub n_possible: usize,
    pub n_obs: u64,
    pub completeness: f64,
    pub mean_intensity: f64,
    pub mean_i_over_sigma: f64,
    pub mean_redundancy: f64,
}

/// Tabulates shell statistics for one list. The possible-reflection count
/// enumerates the asymmetric unit of the resolution sphere through the
/// point group, so completeness is measured against the same folding the
/// data went through.
pub fn shell_statistics(
    list: &ReflList,
    cell: &UnitCell,
    shells: &ResolutionShells,
    sym: &SymOpList,
) -> Vec<ShellStats> {
    let n_shells = shells.count();
    let mut n_unique = vec![0_usize; n_shells];
    let mut n_obs = vec![0_u64; n_shells];
    let mut sum_i = vec![KahanSum::new(); n_shells];
    let mut sum_i_sig = vec![KahanSum::new(); n_shells];
    let mut n_i_sig = vec![0_usize; n_shells];

    for (hkl, refl) in list.iter() {
        let shell = match shells.index_of(cell.resolution(hkl)) {
            Some(s) => s,
            None => continue,
        };
        n_unique[shell] += 1;
        n_obs[shell] += refl.redundancy as u64;
        sum_i[shell].add(refl.intensity);
        if refl.sigma > 0.0 {
            sum_i_sig[shell].add(refl.intensity / refl.sigma);
            n_i_sig[shell] += 1;
        }
    }

    let n_possible = possible_counts(cell, shells, sym);

    (0..n_shells)
        .map(|i| ShellStats {
            dstar_centre: shells.centre(i),
            n_unique: n_unique[i],
            n_possible: n_possible[i],
            n_obs: n_obs[i],
            completeness: if n_possible[i] > 0 {
                n_unique[i] as f64 / n_possible[i] as f64
            } else {
                0.0
            },
            mean_intensity: if n_unique[i] > 0 {
                sum_i[i].value() / n_unique[i] as f64
            } else {
                0.0
            },
            mean_i_over_sigma: if n_i_sig[i] > 0 {
                sum_i_sig[i].value() / n_i_sig[i] as f64
            } else {
                0.0
            },
            mean_redundancy: if n_unique[i] > 0 {
                n_obs[i] as f64 / n_unique[i] as f64
            } else {
                0.0
            },
        })
        .collect()
}

/// Unique asymmetric reflections per shell for a complete sphere out to
/// d*max. Enumerates the index box that covers the sphere and folds each
/// index once.
fn possible_counts(cell: &UnitCell, shells: &ResolutionShells, sym: &SymOpList) -> Vec<usize> {
    let dmax = shells.dstar_max();
    let (a, b, c, _, _, _) = cell.parameters();
    let h_max = (dmax * a).ceil() as i32 + 1;
    let k_max = (dmax * b).ceil() as i32 + 1;
    let l_max = (dmax * c).ceil() as i32 + 1;

    let mut seen: BTreeMap<Miller, usize> = BTreeMap::new();
    for h in -h_max..=h_max {
        for k in -k_max..=k_max {
            for l in -l_max..=l_max {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                let hkl = Miller::new(h, k, l);
                let shell = match shells.index_of(cell.resolution(hkl)) {
                    Some(s) => s,
                    None => continue,
                };
                seen.entry(sym.asymmetric(hkl)).or_insert(shell);
            }
        }
    }

    let mut counts = vec![0_usize; shells.count()];
    for shell in seen.values() {
        counts[*shell] += 1;
    }
    counts
}
