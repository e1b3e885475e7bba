use crate::core::crystal::{Crystal, CrystalStatus};
use crate::core::reflection::{Miller, Reflection, ReflList};
use crate::error::MergeError;
use crate::math::stats::{KahanSum, WeightedMean};
use crate::model::partiality::MIN_PARTIALITY;
use log::debug;
use std::collections::BTreeMap;

/// Knobs for one scaling pass.
#[derive(Debug, Clone)]
pub struct ScaleOptions {
    /// Hold every OSF at 1.0 and merge once (Monte-Carlo averaging).
    pub no_scale: bool,
    /// Merged reflections supported by fewer observations are dropped.
    pub min_measurements: u32,
    pub max_iterations: usize,
    /// Convergence threshold on the largest |delta log OSF|.
    pub convergence: f64,
}

impl Default for ScaleOptions {
    fn default() -> Self {
        Self {
            no_scale: false,
            min_measurements: 2,
            max_iterations: 100,
            convergence: 1e-5,
        }
    }
}

/// What a scaling pass produced, besides the new OSFs written back onto
/// the crystals.
#[derive(Debug)]
pub struct ScaleOutcome {
    pub merged: ReflList,
    pub n_observations: usize,
    pub n_crystals_used: usize,
    /// Crystals flagged SolverFailed during this pass.
    pub n_flagged: usize,
    pub iterations: usize,
    /// Final largest |delta log OSF|; zero for a no-scale pass.
    pub max_shift: f64,
}

/// One scalable observation, detached from its reflection record.
#[derive(Debug, Clone, Copy)]
struct Obs {
    hkl: Miller,
    intensity: f64,
    sigma: f64,
    partiality: f64,
    redundancy: u32,
}

#[derive(Debug, Default)]
struct FullAccum {
    mean: WeightedMean,
    redundancy: u32,
    /// Propagated sigma of the sole contribution, for n = 1.
    single_sigma: f64,
}

/// Solves for per-crystal scale factors and merged full intensities by
/// iterative linear least squares in log-OSF space.
///
/// Holding the full intensities fixed, each crystal's log OSF is the
/// weighted mean of log(I) - log(p) - log(F) over its usable observations;
/// holding the OSFs fixed, each full intensity is the weighted mean of
/// I/(OSF·p). The two half-steps alternate until the largest OSF shift
/// falls below the convergence threshold.
///
/// With a reference list, the reference plays the role of F in the OSF
/// step, which pins the absolute scale; without one the solution is
/// gauge-fixed to zero mean log OSF.
///
/// Crystals whose subproblem is ill-conditioned (no usable observations)
/// are flagged `SolverFailed` and their observations excluded; an entirely
/// empty observation set fails the pass.
pub fn scale_and_merge(
    crystals: &mut [Crystal],
    reference: Option<&ReflList>,
    opts: &ScaleOptions,
) -> Result<ScaleOutcome, MergeError> {
    // 1. Gather the scalable observations per crystal.
    let per_crystal: Vec<Vec<Obs>> = crystals
        .iter()
        .map(|crystal| {
            if !crystal.status.is_ok() {
                return Vec::new();
            }
            crystal
                .reflections
                .iter()
                .filter(|(hkl, r)| {
                    r.scalable
                        && r.sigma > 0.0
                        && r.partiality >= MIN_PARTIALITY
                        && reference.map_or(true, |list| list.contains(*hkl))
                })
                .map(|(hkl, r)| Obs {
                    hkl,
                    intensity: r.intensity,
                    sigma: r.sigma,
                    partiality: r.partiality,
                    redundancy: r.redundancy.max(1),
                })
                .collect()
        })
        .collect();

    let n_observations: usize = per_crystal.iter().map(Vec::len).sum();
    if n_observations == 0 {
        return Err(MergeError::ScalingFailed(
            "no scalable observations in any crystal".into(),
        ));
    }

    let mut active: Vec<usize> = (0..crystals.len())
        .filter(|&c| crystals[c].status.is_ok() && !per_crystal[c].is_empty())
        .collect();
    let mut n_flagged = 0;
    for (c, crystal) in crystals.iter_mut().enumerate() {
        if crystal.status.is_ok() && per_crystal[c].is_empty() {
            crystal.status = CrystalStatus::SolverFailed;
            n_flagged += 1;
        }
    }

    let mut log_osf = vec![0.0_f64; crystals.len()];
    if !opts.no_scale {
        for &c in &active {
            log_osf[c] = crystals[c].osf.ln();
        }
    }

    // 2/3. Alternate OSF and full-intensity updates.
    let mut fulls = compute_fulls(&per_crystal, &active, &log_osf);
    let mut iterations = 0;
    let mut max_shift = 0.0;

    if !opts.no_scale {
        for _ in 0..opts.max_iterations {
            iterations += 1;

            let mut proposed = log_osf.clone();
            let mut failed: Vec<usize> = Vec::new();
            for &c in &active {
                match solve_log_osf(&per_crystal[c], reference, &fulls) {
                    Some(value) => proposed[c] = value,
                    None => failed.push(c),
                }
            }
            for c in failed {
                crystals[c].status = CrystalStatus::SolverFailed;
                active.retain(|&i| i != c);
                n_flagged += 1;
            }
            if active.is_empty() {
                return Err(MergeError::ScalingFailed(
                    "every crystal's scaling subproblem is singular".into(),
                ));
            }

            // Without a reference the overall scale is free; pin it to zero
            // mean log OSF so runs are comparable.
            if reference.is_none() {
                let mut mean = KahanSum::new();
                for &c in &active {
                    mean.add(proposed[c]);
                }
                let mean = mean.value() / active.len() as f64;
                for &c in &active {
                    proposed[c] -= mean;
                }
            }

            max_shift = active
                .iter()
                .map(|&c| (proposed[c] - log_osf[c]).abs())
                .fold(0.0, f64::max);
            log_osf = proposed;
            fulls = compute_fulls(&per_crystal, &active, &log_osf);

            if max_shift < opts.convergence {
                break;
            }
        }
        debug!(
            "scaling: {} iterations, max log-OSF shift {:.3e}, {} active crystals",
            iterations,
            max_shift,
            active.len()
        );
    }

    // 4. Write the OSFs back and assemble the merged list.
    for &c in &active {
        crystals[c].osf = log_osf[c].exp();
    }

    let mut merged = ReflList::new();
    for (hkl, acc) in &fulls {
        if (acc.mean.count() as u32) < opts.min_measurements.max(1) {
            continue;
        }
        let sigma = match acc.mean.std_error() {
            Some(se) => se,
            None => acc.single_sigma,
        };
        merged.insert(
            *hkl,
            Reflection {
                intensity: acc.mean.mean(),
                sigma,
                partiality: 1.0,
                lorentz: 1.0,
                redundancy: acc.redundancy,
                scalable: true,
                refinable: false,
                fs: 0.0,
                ss: 0.0,
            },
        );
    }

    Ok(ScaleOutcome {
        merged,
        n_observations,
        n_crystals_used: active.len(),
        n_flagged,
        iterations,
        max_shift,
    })
}

/// Weighted least squares for one crystal's log OSF, holding the target
/// intensities fixed. Returns None when no observation is usable (all
/// non-positive, or no target available).
fn solve_log_osf(
    obs: &[Obs],
    reference: Option<&ReflList>,
    fulls: &BTreeMap<Miller, FullAccum>,
) -> Option<f64> {
    let mut num = KahanSum::new();
    let mut den = KahanSum::new();

    for o in obs {
        if o.intensity <= 0.0 {
            continue;
        }
        let target = match reference {
            Some(list) => list.find(o.hkl).map(|r| r.intensity),
            None => fulls.get(&o.hkl).map(|acc| acc.mean.mean()),
        };
        let target = match target {
            Some(f) if f > 0.0 => f,
            _ => continue,
        };
        let w = (o.intensity / o.sigma).powi(2);
        num.add(w * (o.intensity.ln() - o.partiality.ln() - target.ln()));
        den.add(w);
    }

    if den.value() > 0.0 {
        Some(num.value() / den.value())
    } else {
        None
    }
}

/// Weighted mean of I/(OSF·p) per asymmetric index over the active
/// crystals, accumulated in crystal order for determinism.
fn compute_fulls(
    per_crystal: &[Vec<Obs>],
    active: &[usize],
    log_osf: &[f64],
) -> BTreeMap<Miller, FullAccum> {
    let mut fulls: BTreeMap<Miller, FullAccum> = BTreeMap::new();
    for &c in active {
        let osf = log_osf[c].exp();
        for o in &per_crystal[c] {
            let corrected = o.intensity / (osf * o.partiality);
            let sigma = o.sigma / (osf * o.partiality);
            let w = 1.0 / (sigma * sigma);
            let acc = fulls.entry(o.hkl).or_default();
            acc.mean.add(corrected, w);
            acc.redundancy += o.redundancy;
            acc.single_sigma = sigma;
        }
    }
    fulls
}
