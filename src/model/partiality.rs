use crate::core::crystal::Crystal;
use crate::core::reflection::Miller;
use crate::math::stats::KahanSum;
use nalgebra::Vector3;

/// Reflections below this partiality are not considered predicted; they
/// are excluded from scaling and counted as "lost" by the update pass.
pub const MIN_PARTIALITY: f64 = 0.05;

/// The per-reflection output of a partiality model.
#[derive(Debug, Clone, Copy)]
pub struct PartialityEstimate {
    /// Captured fraction of the full intensity, in [0, 1].
    pub partiality: f64,
    /// Geometric Lorentz factor. Still snapshots have no rotation sweep,
    /// so both built-in models report 1.0; the field exists for loaders
    /// that supply measured factors.
    pub lorentz: f64,
    /// Signed distance (1/m) of the reciprocal-lattice point from the
    /// Ewald sphere surface; zero means exactly excited.
    pub excitation_error: f64,
}

/// Bookkeeping from refreshing a crystal's partialities after its
/// geometric parameters changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialityUpdate {
    /// Reflections now predicted that were not before.
    pub gained: usize,
    /// Reflections no longer predicted.
    pub lost: usize,
    /// Mean |delta p| over reflections predicted in both states.
    pub mean_abs_delta: f64,
}

/// A partiality model maps a crystal's geometry and a Miller index to the
/// fraction of that reflection captured in the snapshot.
///
/// Models are chosen once per run and dispatched through this trait; the
/// indirection is touched once per reflection and is negligible next to
/// the geometry arithmetic behind it.
pub trait PartialityModel: Sync + Send {
    fn name(&self) -> &'static str;

    /// Whether post-refinement against this model is meaningful. The unity
    /// model has no geometric parameters, so refinement is skipped.
    fn refines(&self) -> bool;

    fn evaluate(&self, crystal: &Crystal, hkl: Miller) -> PartialityEstimate;

    /// Recomputes every reflection's partiality and scalable flag for the
    /// crystal's current geometry, reporting what changed.
    fn update_partialities(&self, crystal: &mut Crystal) -> PartialityUpdate {
        let indices = crystal.reflections.indices();
        let mut gained = 0;
        let mut lost = 0;
        let mut n_both = 0;
        let mut delta_sum = KahanSum::new();

        for hkl in indices {
            let estimate = self.evaluate(crystal, hkl);
            let refl = match crystal.reflections.find_mut(hkl) {
                Some(r) => r,
                None => continue,
            };
            let was_predicted = refl.partiality >= MIN_PARTIALITY;
            let is_predicted = estimate.partiality >= MIN_PARTIALITY;

            match (was_predicted, is_predicted) {
                (false, true) => gained += 1,
                (true, false) => lost += 1,
                (true, true) => {
                    n_both += 1;
                    delta_sum.add((estimate.partiality - refl.partiality).abs());
                }
                (false, false) => {}
            }

            refl.partiality = estimate.partiality;
            refl.lorentz = estimate.lorentz;
            refl.scalable = is_predicted && refl.sigma > 0.0;
        }

        PartialityUpdate {
            gained,
            lost,
            mean_abs_delta: if n_both > 0 {
                delta_sum.value() / n_both as f64
            } else {
                0.0
            },
        }
    }
}

// ============================================================================
// UNITY MODEL
// ============================================================================

/// Every reflection is fully recorded: p = 1. With this model merging
/// reduces to Monte-Carlo averaging and post-refinement is skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnityModel;

impl PartialityModel for UnityModel {
    fn name(&self) -> &'static str {
        "unity"
    }

    fn refines(&self) -> bool {
        false
    }

    fn evaluate(&self, _crystal: &Crystal, _hkl: Miller) -> PartialityEstimate {
        PartialityEstimate {
            partiality: 1.0,
            lorentz: 1.0,
            excitation_error: 0.0,
        }
    }

    /// Deliberately a no-op: loader-supplied partialities and flags are
    /// left untouched, so a unity-model pass changes nothing.
    fn update_partialities(&self, _crystal: &mut Crystal) -> PartialityUpdate {
        PartialityUpdate::default()
    }
}

// ============================================================================
// SPHERE MODEL
// ============================================================================

/// Hard-edged sphere model.
///
/// Each reciprocal-lattice point is a ball of radius `profile_radius`. The
/// Ewald construction for wavelength lambda puts the sphere of radius
/// k = 1/lambda with its centre at -k along the beam axis; bandwidth,
/// mosaicity and divergence thicken it into a shell [k - dk, k + dk] with
///
///   dk = k·bandwidth/2 + (mosaicity·|r| + divergence·r_perp)/2
///
/// where r is the reciprocal position of the reflection and r_perp its
/// component transverse to the beam. The partiality is the fraction of the
/// ball's volume inside the shell, evaluated in closed form by treating
/// the shell walls as parallel planes over the width of the ball (the
/// sphere radius exceeds the profile radius by many orders of magnitude).
#[derive(Debug, Clone, Copy, Default)]
pub struct SphereModel;

/// Volume fraction of the unit ball on the side x <= u of a cutting plane.
fn cap_fraction(u: f64) -> f64 {
    if u <= -1.0 {
        0.0
    } else if u >= 1.0 {
        1.0
    } else {
        (2.0 + 3.0 * u - u * u * u) / 4.0
    }
}

impl SphereModel {
    fn shell_half_width(crystal: &Crystal, r: &Vector3<f64>) -> f64 {
        let k = 1.0 / crystal.wavelength;
        let r_perp = (r.x * r.x + r.y * r.y).sqrt();
        k * crystal.bandwidth / 2.0
            + (crystal.mosaicity * r.norm() + crystal.divergence * r_perp) / 2.0
    }
}

impl PartialityModel for SphereModel {
    fn name(&self) -> &'static str {
        "sphere"
    }

    fn refines(&self) -> bool {
        true
    }

    fn evaluate(&self, crystal: &Crystal, hkl: Miller) -> PartialityEstimate {
        let r = crystal.cell.scattering_vector(hkl);
        let k = 1.0 / crystal.wavelength;

        // Distance from the reciprocal point to the Ewald sphere centre at
        // (0, 0, -k); the excitation error is measured against the sphere
        // surface.
        let from_centre = Vector3::new(r.x, r.y, r.z + k).norm();
        let excitation_error = k - from_centre;

        let dk = Self::shell_half_width(crystal, &r);
        let radius = crystal.profile_radius.max(f64::MIN_POSITIVE);

        let outer = cap_fraction((excitation_error + dk) / radius);
        let inner = cap_fraction((excitation_error - dk) / radius);
        let partiality = (outer - inner).clamp(0.0, 1.0);

        PartialityEstimate {
            partiality,
            lorentz: 1.0,
            excitation_error,
        }
    }
}
