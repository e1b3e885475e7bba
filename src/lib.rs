// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
pub mod analysis;
pub mod core;
pub mod error;
pub mod io;
pub mod math;
pub mod merge;
pub mod model;

// ============================================================================
// RE-EXPORTS (Public API)
// ============================================================================
pub use crate::core::cell::UnitCell;
pub use crate::core::crystal::{Crystal, CrystalStatus};
pub use crate::core::reflection::{
    fold_to_asymmetric, polarisation_correct, Miller, Reflection, ReflList,
};
pub use crate::core::symmetry::SymOpList;
pub use crate::error::MergeError;

pub use crate::analysis::fom::{
    compute_fom, shell_statistics, FomKind, FomResult, FomSelection, NegativePolicy, ShellStats,
};
pub use crate::analysis::shells::ResolutionShells;
pub use crate::io::{parser, writer};
pub use crate::merge::driver::{DriverOptions, IterationReport, MergeDriver, MergeSummary};
pub use crate::merge::postrefine::{post_refine, select_refinable, PostRefineOptions};
pub use crate::merge::scale::{scale_and_merge, ScaleOptions};
pub use crate::model::partiality::{PartialityModel, SphereModel, UnityModel, MIN_PARTIALITY};

use anyhow::{Context, Result};
use std::sync::atomic::AtomicBool;

// ============================================================================
// HIGH-LEVEL INTERFACE
// ============================================================================

/// Which partiality model drives merging and post-refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelChoice {
    /// p = 1 everywhere; merging is Monte-Carlo averaging and
    /// post-refinement is skipped.
    #[default]
    Unity,
    /// Ewald-shell / profile-ball intersection model.
    Sphere,
}

impl ModelChoice {
    pub fn from_name(name: &str) -> std::result::Result<Self, MergeError> {
        match name {
            "unity" => Ok(ModelChoice::Unity),
            "sphere" => Ok(ModelChoice::Sphere),
            other => Err(MergeError::Input(format!(
                "unknown partiality model '{}'",
                other
            ))),
        }
    }

    pub fn build(self) -> Box<dyn PartialityModel> {
        match self {
            ModelChoice::Unity => Box::new(UnityModel),
            ModelChoice::Sphere => Box::new(SphereModel),
        }
    }
}

/// Configuration for the merging pipeline.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Outer scale + refine cycles (after the initial scaling pass).
    pub iterations: usize,
    /// Hold all OSFs at 1.0.
    pub no_scale: bool,
    pub model: ModelChoice,
    /// Merged reflections below this redundancy are dropped.
    pub min_measurements: u32,
    /// Apply the polarisation correction before the first scaling pass.
    pub polarisation: bool,
    /// Horizontal polarisation fraction; 0.5 is unpolarised.
    pub polarisation_fraction: f64,
    /// Point group for asymmetric folding.
    pub point_group: String,
    /// Worker threads for post-refinement; None uses the rayon default.
    pub threads: Option<usize>,
    /// Crystals with fewer refinable reflections are flagged NoRefinement.
    pub min_refinable: usize,
    /// Flag a crystal once refinement loses more than this fraction of its
    /// scalable reflections.
    pub max_lost_fraction: f64,
    /// Optional resolution cutoffs in d* (1/m).
    pub dstar_min: Option<f64>,
    pub dstar_max: Option<f64>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            no_scale: false,
            model: ModelChoice::Unity,
            min_measurements: 2,
            polarisation: true,
            polarisation_fraction: 0.5,
            point_group: "1".to_string(),
            threads: None,
            min_refinable: 10,
            max_lost_fraction: 0.5,
            dstar_min: None,
            dstar_max: None,
        }
    }
}

impl MergeConfig {
    /// The driver-level options this configuration corresponds to.
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            iterations: self.iterations,
            polarisation: self.polarisation.then_some(self.polarisation_fraction),
            scale: ScaleOptions {
                no_scale: self.no_scale,
                min_measurements: self.min_measurements,
                ..ScaleOptions::default()
            },
            refine: PostRefineOptions {
                min_refinable: self.min_refinable,
                max_lost_fraction: self.max_lost_fraction,
                ..PostRefineOptions::default()
            },
            threads: self.threads,
            dstar_min: self.dstar_min,
            dstar_max: self.dstar_max,
        }
    }
}

/// The master pipeline function: folds, scales and post-refines a set of
/// loaded crystals, returning the merged list plus the crystals with their
/// final parameters.
pub fn merge_dataset(
    crystals: Vec<Crystal>,
    reference: Option<&ReflList>,
    config: &MergeConfig,
    cancel: &AtomicBool,
) -> Result<(MergeSummary, Vec<Crystal>)> {
    // 1. SYMMETRY PHASE
    let sym = SymOpList::from_name(&config.point_group)?;

    // 2. MODEL PHASE
    let model = config.model.build();

    // 3. MERGE PHASE
    let mut driver = MergeDriver::new(
        crystals,
        model.as_ref(),
        &sym,
        reference,
        config.driver_options(),
    );
    let summary = driver.run(cancel).context("Merging pipeline failed")?;

    Ok((summary, driver.into_crystals()))
}
