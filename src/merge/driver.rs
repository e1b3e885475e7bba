use crate::core::crystal::{Crystal, CrystalStatus};
use crate::core::reflection::{fold_to_asymmetric, polarisation_correct, ReflList};
use crate::core::symmetry::SymOpList;
use crate::error::MergeError;
use crate::math::stats::KahanSum;
use crate::merge::postrefine::{post_refine, select_refinable, PostRefineOptions};
use crate::merge::scale::{scale_and_merge, ScaleOptions, ScaleOutcome};
use crate::model::partiality::PartialityModel;
use log::{info, warn};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Driver-level knobs; the public `MergeConfig` in the crate root maps
/// onto these.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Outer scale + refine cycles after the initial scaling pass.
    pub iterations: usize,
    /// Horizontal polarisation fraction to correct for; None disables the
    /// correction entirely.
    pub polarisation: Option<f64>,
    pub scale: ScaleOptions,
    pub refine: PostRefineOptions,
    /// Worker threads for post-refinement; None uses the rayon default.
    pub threads: Option<usize>,
    /// Optional resolution cutoffs (d* in 1/m) applied while loading.
    pub dstar_min: Option<f64>,
    pub dstar_max: Option<f64>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            iterations: 10,
            polarisation: Some(0.5),
            scale: ScaleOptions::default(),
            refine: PostRefineOptions::default(),
            threads: None,
            dstar_min: None,
            dstar_max: None,
        }
    }
}

/// Per-iteration summary, logged and retained for the scaling report.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub n_crystals: usize,
    /// Crystals that contributed observations to this scaling pass.
    pub n_active: usize,
    pub n_observations: usize,
    pub max_shift: f64,
    pub n_no_refinement: usize,
    pub n_solver_failed: usize,
    pub n_lost: usize,
    /// R-factor of the merged list against the reference, when one was
    /// supplied.
    pub r_reference: Option<f64>,
}

/// The finished product of a merge run.
#[derive(Debug)]
pub struct MergeSummary {
    pub merged: ReflList,
    pub reports: Vec<IterationReport>,
    pub cancelled: bool,
}

/// Orchestrates the outer loop: correct and fold the input crystals,
/// scale, then alternate post-refinement and re-scaling.
pub struct MergeDriver<'a> {
    crystals: Vec<Crystal>,
    model: &'a dyn PartialityModel,
    sym: &'a SymOpList,
    reference: Option<&'a ReflList>,
    opts: DriverOptions,
    reports: Vec<IterationReport>,
    last_merged: Option<ReflList>,
}

impl<'a> MergeDriver<'a> {
    pub fn new(
        crystals: Vec<Crystal>,
        model: &'a dyn PartialityModel,
        sym: &'a SymOpList,
        reference: Option<&'a ReflList>,
        opts: DriverOptions,
    ) -> Self {
        Self {
            crystals,
            model,
            sym,
            reference,
            opts,
            reports: Vec::new(),
            last_merged: None,
        }
    }

    pub fn crystals(&self) -> &[Crystal] {
        &self.crystals
    }

    /// Hands the crystals back once the run is over, with their final
    /// OSFs, geometries and status flags.
    pub fn into_crystals(self) -> Vec<Crystal> {
        self.crystals
    }

    pub fn reports(&self) -> &[IterationReport] {
        &self.reports
    }

    /// The most recent merged list, if any pass completed. Lets callers
    /// flush the last good result when a later pass fails.
    pub fn take_last_merged(&mut self) -> Option<ReflList> {
        self.last_merged.take()
    }

    /// Runs the full merge. `cancel` is checked at each outer iteration
    /// boundary; a cancellation returns the previous iteration's merged
    /// list cleanly.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<MergeSummary, MergeError> {
        self.prepare();

        // Initial scaling pass over the corrected, folded input.
        let outcome = scale_and_merge(&mut self.crystals, self.reference, &self.opts.scale)?;
        self.report(0, &outcome, &outcome.merged);
        let mut merged = outcome.merged;
        self.last_merged = Some(merged.clone());

        let mut cancelled = false;
        for iteration in 1..=self.opts.iterations {
            if cancel.load(Ordering::Relaxed) {
                info!("cancellation requested; stopping after iteration {}", iteration - 1);
                cancelled = true;
                break;
            }

            // Every crystal gets a fresh chance; flags from the previous
            // iteration are advisory, not permanent.
            for crystal in self.crystals.iter_mut() {
                crystal.status = CrystalStatus::Ok;
            }

            let have_reference = self.reference.is_some();
            for crystal in self.crystals.iter_mut() {
                select_refinable(crystal, &merged, have_reference);
            }

            if self.model.refines() {
                self.parallel_refine(&merged)?;
            }

            let outcome = scale_and_merge(&mut self.crystals, self.reference, &self.opts.scale)?;
            self.report(iteration, &outcome, &outcome.merged);
            merged = outcome.merged;
            self.last_merged = Some(merged.clone());
        }

        Ok(MergeSummary {
            merged,
            reports: self.reports.clone(),
            cancelled,
        })
    }

    /// Polarisation correction, resolution cutoffs, asymmetric folding and
    /// the initial partiality estimate, each applied exactly once.
    fn prepare(&mut self) {
        let sym = self.sym;
        for crystal in self.crystals.iter_mut() {
            if let Some(fraction) = self.opts.polarisation {
                polarisation_correct(
                    &mut crystal.reflections,
                    &crystal.cell,
                    crystal.wavelength,
                    fraction,
                );
            }

            if self.opts.dstar_min.is_some() || self.opts.dstar_max.is_some() {
                let lo = self.opts.dstar_min.unwrap_or(0.0);
                let hi = self.opts.dstar_max.unwrap_or(f64::INFINITY);
                let mut kept = ReflList::new();
                for (hkl, refl) in crystal.reflections.iter() {
                    let dstar = crystal.cell.resolution(hkl);
                    if dstar >= lo && dstar <= hi {
                        kept.insert(hkl, refl.clone());
                    }
                }
                crystal.reflections = kept;
            }

            crystal.reflections = fold_to_asymmetric(&crystal.reflections, sym);
            self.model.update_partialities(crystal);
        }
        info!(
            "prepared {} crystals (point group {}, model {})",
            self.crystals.len(),
            self.sym.name(),
            self.model.name()
        );
    }

    /// Post-refinement is embarrassingly parallel: the merged list is
    /// read-only and each worker owns exactly one crystal.
    fn parallel_refine(&mut self, merged: &ReflList) -> Result<(), MergeError> {
        let model = self.model;
        let refine_opts = &self.opts.refine;

        let refine_all = |crystals: &mut [Crystal]| {
            crystals.par_iter_mut().for_each(|crystal| {
                if crystal.status.is_ok() {
                    post_refine(crystal, merged, model, refine_opts);
                }
            });
        };

        match self.opts.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| MergeError::Input(format!("thread pool: {}", e)))?;
                pool.install(|| refine_all(&mut self.crystals));
            }
            None => refine_all(&mut self.crystals),
        }
        Ok(())
    }

    fn report(&mut self, iteration: usize, outcome: &ScaleOutcome, merged: &ReflList) {
        let mut n_no_refinement = 0;
        let mut n_solver_failed = 0;
        let mut n_lost = 0;
        for crystal in &self.crystals {
            match crystal.status {
                CrystalStatus::Ok => {}
                CrystalStatus::NoRefinement => n_no_refinement += 1,
                CrystalStatus::SolverFailed => n_solver_failed += 1,
                CrystalStatus::LostTooMany => n_lost += 1,
            }
        }

        let r_reference = self.reference.and_then(|reference| {
            let mut num = KahanSum::new();
            let mut den = KahanSum::new();
            for (hkl, refl) in merged.iter() {
                if let Some(target) = reference.find(hkl) {
                    num.add((refl.intensity - target.intensity).abs());
                    den.add(target.intensity);
                }
            }
            (den.value() > 0.0).then(|| num.value() / den.value())
        });

        info!(
            "iteration {:2}: {} active of {} crystals, {} observations, {} unique, max shift {:.2e}",
            iteration,
            outcome.n_crystals_used,
            self.crystals.len(),
            outcome.n_observations,
            merged.len(),
            outcome.max_shift,
        );
        if let Some(r) = r_reference {
            info!("iteration {:2}: R vs reference = {:.4}", iteration, r);
        }
        let n_flagged = n_no_refinement + n_solver_failed + n_lost;
        if n_flagged > 0 {
            warn!(
                "{} crystals could not be refined: {} no-ref, {} solve-failed, {} lost",
                n_flagged, n_no_refinement, n_solver_failed, n_lost
            );
        }

        self.reports.push(IterationReport {
            iteration,
            n_crystals: self.crystals.len(),
            n_active: outcome.n_crystals_used,
            n_observations: outcome.n_observations,
            max_shift: outcome.max_shift,
            n_no_refinement,
            n_solver_failed,
            n_lost,
            r_reference,
        });
    }
}
