use crate::core::reflection::Miller;
use crate::error::MergeError;
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// A unit cell held as three Cartesian real-space axis vectors (columns of
/// `axes`, in metres) together with the precomputed reciprocal axes
/// (columns of `reciprocal`, in 1/m). Immutable after construction; the
/// refinement operations return new cells.
#[derive(Debug, Clone)]
pub struct UnitCell {
    axes: Matrix3<f64>,
    reciprocal: Matrix3<f64>,
}

impl UnitCell {
    /// Builds a cell from explicit axis vectors (columns a, b, c in metres).
    /// The axes must form a right-handed, non-degenerate basis.
    pub fn from_axes(axes: Matrix3<f64>) -> Result<Self, MergeError> {
        let volume = axes.determinant();
        let a = axes.column(0).norm();
        let b = axes.column(1).norm();
        let c = axes.column(2).norm();

        if !(a > 0.0 && b > 0.0 && c > 0.0) {
            return Err(MergeError::DegenerateCell("zero-length axis".into()));
        }
        if volume <= 0.0 {
            return Err(MergeError::DegenerateCell(
                "axis basis is left-handed or singular".into(),
            ));
        }
        // Relative volume check: absolute thresholds are useless at metre
        // scale, where a typical cell volume is ~1e-27 m^3.
        if volume < 1e-6 * a * b * c {
            return Err(MergeError::DegenerateCell(
                "axis basis is nearly coplanar".into(),
            ));
        }

        let reciprocal = axes
            .try_inverse()
            .ok_or_else(|| MergeError::DegenerateCell("axis basis not invertible".into()))?
            .transpose();

        Ok(Self { axes, reciprocal })
    }

    /// Builds a cell from the six scalar parameters: lengths in metres,
    /// angles in degrees.
    pub fn from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
    ) -> Result<Self, MergeError> {
        let alpha_r = alpha.to_radians();
        let beta_r = beta.to_radians();
        let gamma_r = gamma.to_radians();

        let term = 1.0 - alpha_r.cos().powi(2) - beta_r.cos().powi(2) - gamma_r.cos().powi(2)
            + 2.0 * alpha_r.cos() * beta_r.cos() * gamma_r.cos();
        if term <= 0.0 {
            return Err(MergeError::DegenerateCell("invalid cell angles".into()));
        }
        let v_factor = term.sqrt();

        let a_axis = Vector3::new(a, 0.0, 0.0);
        let b_axis = Vector3::new(b * gamma_r.cos(), b * gamma_r.sin(), 0.0);
        let c_axis = Vector3::new(
            c * beta_r.cos(),
            c * (alpha_r.cos() - beta_r.cos() * gamma_r.cos()) / gamma_r.sin(),
            c * v_factor / gamma_r.sin(),
        );

        Self::from_axes(Matrix3::from_columns(&[a_axis, b_axis, c_axis]))
    }

    /// Recovers (a, b, c, alpha, beta, gamma) in metres and degrees.
    pub fn parameters(&self) -> (f64, f64, f64, f64, f64, f64) {
        let a = self.axes.column(0).norm();
        let b = self.axes.column(1).norm();
        let c = self.axes.column(2).norm();
        let alpha = (self.axes.column(1).dot(&self.axes.column(2)) / (b * c))
            .acos()
            .to_degrees();
        let beta = (self.axes.column(0).dot(&self.axes.column(2)) / (a * c))
            .acos()
            .to_degrees();
        let gamma = (self.axes.column(0).dot(&self.axes.column(1)) / (a * b))
            .acos()
            .to_degrees();
        (a, b, c, alpha, beta, gamma)
    }

    pub fn axes(&self) -> &Matrix3<f64> {
        &self.axes
    }

    /// Reciprocal axis vectors a*, b*, c* as matrix columns (1/m).
    pub fn reciprocal(&self) -> &Matrix3<f64> {
        &self.reciprocal
    }

    /// Cell volume in cubic metres.
    pub fn volume(&self) -> f64 {
        self.axes.determinant()
    }

    /// The reciprocal-space position h·a* + k·b* + l·c* of a reflection.
    pub fn scattering_vector(&self, hkl: Miller) -> Vector3<f64> {
        self.reciprocal * Vector3::new(hkl.h as f64, hkl.k as f64, hkl.l as f64)
    }

    /// Resolution d* = |h·a* + k·b* + l·c*| in 1/m. Higher values are finer
    /// detail; d* is the inverse of the lattice-plane spacing.
    pub fn resolution(&self, hkl: Miller) -> f64 {
        self.scattering_vector(hkl).norm()
    }

    /// Returns the cell with all axes rotated by the unit quaternion `q`.
    /// Rotation preserves the determinant, so this cannot fail.
    pub fn rotated(&self, q: &UnitQuaternion<f64>) -> UnitCell {
        let r = *q.to_rotation_matrix().matrix();
        UnitCell {
            axes: r * self.axes,
            reciprocal: r * self.reciprocal,
        }
    }

    /// Compares two cells up to axis relabelling (lattice ambiguity):
    /// sorted lengths must agree within `length_tol` (relative) and sorted
    /// angles within `angle_tol` degrees. Orientation is ignored.
    pub fn similar_to(&self, other: &UnitCell, length_tol: f64, angle_tol: f64) -> bool {
        let params = |cell: &UnitCell| {
            let (a, b, c, alpha, beta, gamma) = cell.parameters();
            let mut lengths = [a, b, c];
            let mut angles = [alpha, beta, gamma];
            lengths.sort_by(f64::total_cmp);
            angles.sort_by(f64::total_cmp);
            (lengths, angles)
        };
        let (la, aa) = params(self);
        let (lb, ab) = params(other);

        la.iter()
            .zip(lb.iter())
            .all(|(x, y)| (x - y).abs() <= length_tol * x.max(*y))
            && aa
                .iter()
                .zip(ab.iter())
                .all(|(x, y)| (x - y).abs() <= angle_tol)
    }

    /// Returns the cell with every axis scaled by (1 + strain). Strains at
    /// or below -1 would collapse the cell and are rejected.
    pub fn strained(&self, strain: f64) -> Result<UnitCell, MergeError> {
        let s = 1.0 + strain;
        if s <= 0.0 {
            return Err(MergeError::DegenerateCell(format!(
                "strain {} collapses the cell",
                strain
            )));
        }
        Self::from_axes(self.axes * s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn orthorhombic() -> UnitCell {
        UnitCell::from_parameters(4.0e-9, 5.0e-9, 6.0e-9, 90.0, 90.0, 90.0).unwrap()
    }

    #[test]
    fn parameters_round_trip() {
        let cell = UnitCell::from_parameters(4.0e-9, 5.0e-9, 6.0e-9, 90.0, 100.0, 95.0).unwrap();
        let (a, b, c, alpha, beta, gamma) = cell.parameters();
        assert_relative_eq!(a, 4.0e-9, max_relative = 1e-12);
        assert_relative_eq!(b, 5.0e-9, max_relative = 1e-12);
        assert_relative_eq!(c, 6.0e-9, max_relative = 1e-12);
        assert_relative_eq!(alpha, 90.0, max_relative = 1e-9);
        assert_relative_eq!(beta, 100.0, max_relative = 1e-9);
        assert_relative_eq!(gamma, 95.0, max_relative = 1e-9);
    }

    #[test]
    fn orthorhombic_resolution() {
        let cell = orthorhombic();
        // d*(h00) = h/a for an orthorhombic cell.
        assert_relative_eq!(
            cell.resolution(Miller::new(2, 0, 0)),
            2.0 / 4.0e-9,
            max_relative = 1e-12
        );
        let d_star = cell.resolution(Miller::new(1, 1, 1));
        let expected = ((1.0 / 4.0e-9_f64).powi(2)
            + (1.0 / 5.0e-9_f64).powi(2)
            + (1.0 / 6.0e-9_f64).powi(2))
        .sqrt();
        assert_relative_eq!(d_star, expected, max_relative = 1e-12);
    }

    #[test]
    fn rotation_preserves_resolution() {
        let cell = orthorhombic();
        let q = UnitQuaternion::from_scaled_axis(Vector3::new(0.3, -0.2, 0.9));
        let rotated = cell.rotated(&q);
        for hkl in [Miller::new(1, 0, 0), Miller::new(3, -2, 5)] {
            assert_relative_eq!(
                cell.resolution(hkl),
                rotated.resolution(hkl),
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn strain_scales_resolution_inversely() {
        let cell = orthorhombic();
        let strained = cell.strained(0.01).unwrap();
        assert_relative_eq!(
            strained.resolution(Miller::new(1, 2, 3)),
            cell.resolution(Miller::new(1, 2, 3)) / 1.01,
            max_relative = 1e-12
        );
        assert!(cell.strained(-1.0).is_err());
    }

    #[test]
    fn similarity_ignores_axis_order_and_orientation() {
        let cell = UnitCell::from_parameters(4.0e-9, 5.0e-9, 6.0e-9, 90.0, 90.0, 90.0).unwrap();
        let relabelled =
            UnitCell::from_parameters(6.0e-9, 4.0e-9, 5.0e-9, 90.0, 90.0, 90.0).unwrap();
        let rotated = cell.rotated(&UnitQuaternion::from_scaled_axis(Vector3::new(
            0.1, 0.2, -0.3,
        )));
        let different = UnitCell::from_parameters(4.4e-9, 5.0e-9, 6.0e-9, 90.0, 90.0, 90.0).unwrap();

        assert!(cell.similar_to(&relabelled, 1e-6, 1e-6));
        assert!(cell.similar_to(&rotated, 1e-6, 1e-6));
        assert!(!cell.similar_to(&different, 0.01, 0.5));
    }

    #[test]
    fn degenerate_axes_are_rejected() {
        let coplanar = Matrix3::from_columns(&[
            Vector3::new(1.0e-9, 0.0, 0.0),
            Vector3::new(0.0, 1.0e-9, 0.0),
            Vector3::new(1.0e-9, 1.0e-9, 0.0),
        ]);
        assert!(matches!(
            UnitCell::from_axes(coplanar),
            Err(MergeError::DegenerateCell(_))
        ));
    }
}
