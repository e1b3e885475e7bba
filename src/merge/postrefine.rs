use crate::core::crystal::{Crystal, CrystalStatus};
use crate::core::reflection::{Miller, ReflList};
use crate::math::lm::{self, LmOptions};
use crate::model::partiality::PartialityModel;
use log::trace;
use nalgebra::{DVector, UnitQuaternion, Vector3};

/// Scale of the divergence parameter in the solver's coordinate system,
/// in radians. Beam divergences sit in the 1e-4 rad regime, so one solver
/// unit corresponds to a physically sensible move.
const DIVERGENCE_SCALE: f64 = 1.0e-4;

/// Knobs for per-crystal post-refinement.
#[derive(Debug, Clone)]
pub struct PostRefineOptions {
    /// Below this many refinable reflections the crystal is flagged
    /// NoRefinement and skipped.
    pub min_refinable: usize,
    /// Flag the crystal LostTooMany when refinement drops more than this
    /// fraction of its previously scalable reflections.
    pub max_lost_fraction: f64,
    pub lm: LmOptions,
}

impl Default for PostRefineOptions {
    fn default() -> Self {
        Self {
            min_refinable: 10,
            max_lost_fraction: 0.5,
            lm: LmOptions::default(),
        }
    }
}

/// What one refinement attempt did to its crystal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefineOutcome {
    pub attempted: bool,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Reflections newly predicted / no longer predicted after the
    /// partiality refresh.
    pub gained: usize,
    pub lost: usize,
}

/// Marks the reflections eligible for post-refinement and returns their
/// count. A reflection is refinable when it is scalable, strong
/// (I/sigma >= 3), and its index is present in the merged list with
/// redundancy >= 2 (any redundancy when the target is an external
/// reference).
pub fn select_refinable(crystal: &mut Crystal, full: &ReflList, have_reference: bool) -> usize {
    let mut count = 0;
    for (hkl, refl) in crystal.reflections.iter_mut() {
        let strong = refl.sigma > 0.0 && refl.intensity / refl.sigma >= 3.0;
        let present = full
            .find(hkl)
            .map_or(false, |f| have_reference || f.redundancy >= 2);
        refl.refinable = refl.scalable && strong && present;
        if refl.refinable {
            count += 1;
        }
    }
    count
}

/// Refines one crystal's geometry against the current merged intensities.
///
/// Six parameters are adjusted: a rotation vector applied to the cell
/// orientation, an isotropic cell strain, the profile radius (refined in
/// log space, which keeps it positive), and the beam divergence. The
/// residuals are w·(I/OSF - p·F) over the refinable reflections, solved
/// by Levenberg-Marquardt; crystals are independent, so callers may run
/// this in parallel over the crystal slice.
///
/// On success the crystal's partialities are refreshed and the gain/loss
/// counters filled in. The crystal's status is updated in place:
/// NoRefinement, SolverFailed or LostTooMany as the attempt plays out.
pub fn post_refine(
    crystal: &mut Crystal,
    full: &ReflList,
    model: &dyn PartialityModel,
    opts: &PostRefineOptions,
) -> RefineOutcome {
    // Unity-model merging has nothing to refine; leave the crystal
    // untouched.
    if !model.refines() {
        return RefineOutcome::default();
    }

    let targets: Vec<(Miller, f64, f64, f64)> = crystal
        .reflections
        .iter()
        .filter(|(_, r)| r.refinable && r.sigma > 0.0)
        .filter_map(|(hkl, r)| {
            full.find(hkl).map(|f| {
                let weight = 1.0 / (r.sigma * r.sigma);
                (hkl, r.intensity / crystal.osf, weight, f.intensity)
            })
        })
        .collect();

    if targets.len() < opts.min_refinable {
        crystal.status = CrystalStatus::NoRefinement;
        return RefineOutcome::default();
    }

    let n_scalable_before = crystal.n_scalable();

    // A geometry-only copy for trial evaluations; the model never reads
    // the reflection list.
    let mut template = crystal.clone();
    template.reflections = ReflList::new();
    let base_cell = crystal.cell.clone();
    let radius0 = crystal.profile_radius;
    let divergence0 = crystal.divergence;

    let apply = |x: &DVector<f64>, geom: &mut Crystal| -> bool {
        let q = UnitQuaternion::from_scaled_axis(Vector3::new(x[0], x[1], x[2]));
        match base_cell.rotated(&q).strained(x[3]) {
            Ok(cell) => geom.cell = cell,
            Err(_) => return false,
        }
        geom.profile_radius = radius0 * x[4].exp();
        geom.divergence = (divergence0 + DIVERGENCE_SCALE * x[5]).max(0.0);
        true
    };

    let residuals = |x: &DVector<f64>| -> DVector<f64> {
        let mut geom = template.clone();
        if !apply(x, &mut geom) {
            // An unphysical trial point: make it strictly worse than any
            // physical one so the solver backs off.
            return DVector::from_element(targets.len(), 1.0e100);
        }
        DVector::from_iterator(
            targets.len(),
            targets.iter().map(|(hkl, iobs, weight, f_full)| {
                let p = model.evaluate(&geom, *hkl).partiality;
                weight.sqrt() * (iobs - p * f_full)
            }),
        )
    };

    let solved = lm::minimise(residuals, DVector::zeros(6), &opts.lm);
    trace!(
        "post-refine {}: cost {:.4e} -> {:.4e} in {} iterations",
        crystal.ident.as_deref().unwrap_or("?"),
        solved.initial_cost,
        solved.final_cost,
        solved.iterations
    );

    if !solved.improved {
        // A residual already at the numerical floor has nowhere to go;
        // that is convergence, not failure.
        let at_optimum = solved.initial_cost <= 1e-9 * targets.len() as f64;
        if !at_optimum {
            crystal.status = CrystalStatus::SolverFailed;
        }
        return RefineOutcome {
            attempted: true,
            iterations: solved.iterations,
            initial_cost: solved.initial_cost,
            final_cost: solved.final_cost,
            ..RefineOutcome::default()
        };
    }

    // Commit the refined geometry, then refresh the partialities.
    apply(&solved.x, crystal);
    let update = model.update_partialities(crystal);

    let n_scalable_after = crystal.n_scalable();
    if n_scalable_before > 0 {
        let lost_fraction =
            (n_scalable_before.saturating_sub(n_scalable_after)) as f64 / n_scalable_before as f64;
        if lost_fraction > opts.max_lost_fraction {
            crystal.status = CrystalStatus::LostTooMany;
        }
    }

    RefineOutcome {
        attempted: true,
        iterations: solved.iterations,
        initial_cost: solved.initial_cost,
        final_cost: solved.final_cost,
        gained: update.gained,
        lost: update.lost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cell::UnitCell;
    use crate::model::partiality::{SphereModel, UnityModel};
    use approx::assert_relative_eq;

    fn cubic_crystal() -> Crystal {
        let cell = UnitCell::from_parameters(4.0e-9, 4.0e-9, 4.0e-9, 90.0, 90.0, 90.0).unwrap();
        let mut crystal = Crystal::new(cell, 1.3e-10);
        crystal.profile_radius = 2.0e7;
        crystal.bandwidth = 0.05;
        crystal
    }

    fn full_list(indices: &[Miller], intensity: f64) -> ReflList {
        let mut list = ReflList::new();
        for &hkl in indices {
            let refl = list.add(hkl);
            refl.intensity = intensity;
            refl.sigma = intensity.sqrt();
            refl.redundancy = 5;
        }
        list
    }

    #[test]
    fn refinable_selection_criteria() {
        let mut crystal = cubic_crystal();
        // Strong, present in full: refinable.
        let a = Miller::new(1, 0, 0);
        // Weak: not refinable.
        let b = Miller::new(0, 1, 0);
        // Absent from full list: not refinable.
        let c = Miller::new(0, 0, 1);
        for (hkl, i, sigma) in [(a, 100.0, 5.0), (b, 10.0, 5.0), (c, 100.0, 5.0)] {
            let refl = crystal.reflections.add(hkl);
            refl.intensity = i;
            refl.sigma = sigma;
        }
        let full = full_list(&[a, b], 100.0);

        let n = select_refinable(&mut crystal, &full, false);
        assert_eq!(n, 1);
        assert!(crystal.reflections.find(a).unwrap().refinable);
        assert!(!crystal.reflections.find(b).unwrap().refinable);
        assert!(!crystal.reflections.find(c).unwrap().refinable);
    }

    #[test]
    fn redundancy_gate_relaxes_with_reference() {
        let mut crystal = cubic_crystal();
        let hkl = Miller::new(1, 0, 0);
        let refl = crystal.reflections.add(hkl);
        refl.intensity = 90.0;
        refl.sigma = 3.0;

        let mut sparse_full = full_list(&[hkl], 90.0);
        sparse_full.find_mut(hkl).unwrap().redundancy = 1;

        assert_eq!(select_refinable(&mut crystal, &sparse_full, false), 0);
        assert_eq!(select_refinable(&mut crystal, &sparse_full, true), 1);
    }

    #[test]
    fn unity_model_refinement_is_a_no_op() {
        let mut crystal = cubic_crystal();
        for h in 1..20 {
            let refl = crystal.reflections.add(Miller::new(h, 0, 0));
            refl.intensity = 100.0;
            refl.sigma = 1.0;
            refl.refinable = true;
        }
        let before = crystal.clone();
        let full = full_list(&crystal.reflections.indices(), 100.0);

        let outcome = post_refine(
            &mut crystal,
            &full,
            &UnityModel,
            &PostRefineOptions::default(),
        );

        assert!(!outcome.attempted);
        assert_eq!(crystal.status, CrystalStatus::Ok);
        assert_relative_eq!(crystal.osf, before.osf);
        assert_eq!(crystal.cell.axes(), before.cell.axes());
        for (hkl, refl) in before.reflections.iter() {
            let after = crystal.reflections.find(hkl).unwrap();
            assert_relative_eq!(after.intensity, refl.intensity);
            assert_relative_eq!(after.partiality, refl.partiality);
        }
    }

    #[test]
    fn too_few_refinable_flags_no_refinement() {
        let mut crystal = cubic_crystal();
        let refl = crystal.reflections.add(Miller::new(1, 0, 0));
        refl.intensity = 100.0;
        refl.sigma = 1.0;
        refl.refinable = true;
        let full = full_list(&[Miller::new(1, 0, 0)], 100.0);

        let outcome = post_refine(
            &mut crystal,
            &full,
            &SphereModel,
            &PostRefineOptions::default(),
        );
        assert!(!outcome.attempted);
        assert_eq!(crystal.status, CrystalStatus::NoRefinement);
    }

    #[test]
    fn sphere_refinement_reduces_the_residual_of_a_perturbed_crystal() {
        // Build a "true" crystal, compute consistent observations, then
        // perturb the orientation and check that refinement walks back.
        let truth = {
            let mut c = cubic_crystal();
            // A narrow shell keeps plenty of reflections at fractional
            // partiality, which is what makes orientation observable.
            c.bandwidth = 0.01;
            for h in -8..=8_i32 {
                for k in -8..=8_i32 {
                    for l in -8..=8_i32 {
                        if h == 0 && k == 0 && l == 0 {
                            continue;
                        }
                        let refl = c.reflections.add(Miller::new(h, k, l));
                        refl.intensity = 0.0;
                        refl.sigma = 1.0;
                    }
                }
            }
            SphereModel.update_partialities(&mut c);
            c
        };

        // Observed intensity = p_true * F for every predicted reflection.
        let f_full = 1000.0;
        let mut crystal = truth.clone();
        let mut full = ReflList::new();
        let mut n_strong = 0;
        for hkl in truth.reflections.indices() {
            let p = truth.reflections.find(hkl).unwrap().partiality;
            let refl = crystal.reflections.find_mut(hkl).unwrap();
            if refl.scalable {
                refl.intensity = p * f_full;
                refl.sigma = (p * f_full).abs().sqrt().max(1.0);
                refl.refinable = refl.intensity / refl.sigma >= 3.0;
                if refl.refinable {
                    n_strong += 1;
                    let target = full.add(hkl);
                    target.intensity = f_full;
                    target.sigma = f_full.sqrt();
                    target.redundancy = 10;
                }
            }
        }
        assert!(n_strong >= 10, "need a usable refinement problem");

        // Perturb the orientation by ~0.2 mrad.
        let q = UnitQuaternion::from_scaled_axis(Vector3::new(2.0e-4, -1.5e-4, 1.0e-4));
        crystal.cell = crystal.cell.rotated(&q);

        let outcome = post_refine(
            &mut crystal,
            &full,
            &SphereModel,
            &PostRefineOptions::default(),
        );

        assert!(outcome.attempted);
        assert!(
            outcome.final_cost < outcome.initial_cost,
            "cost {} -> {}",
            outcome.initial_cost,
            outcome.final_cost
        );
        assert!(crystal.status == CrystalStatus::Ok || crystal.status == CrystalStatus::LostTooMany);
    }
}
