use crate::core::reflection::Miller;
use crate::error::MergeError;
use nalgebra::{Matrix3, Vector3};

// ============================================================================
// OPERATOR PRIMITIVES
// ============================================================================

type Op = Matrix3<i32>;

fn identity() -> Op {
    Matrix3::identity()
}

fn inversion() -> Op {
    -Matrix3::<i32>::identity()
}

/// Two-fold rotations about the Cartesian-aligned axes.
fn rot2_x() -> Op {
    Matrix3::from_diagonal(&Vector3::new(1, -1, -1))
}
fn rot2_y() -> Op {
    Matrix3::from_diagonal(&Vector3::new(-1, 1, -1))
}
fn rot2_z() -> Op {
    Matrix3::from_diagonal(&Vector3::new(-1, -1, 1))
}

/// Mirrors perpendicular to the axes.
fn mirror_x() -> Op {
    Matrix3::from_diagonal(&Vector3::new(-1, 1, 1))
}
fn mirror_y() -> Op {
    Matrix3::from_diagonal(&Vector3::new(1, -1, 1))
}
fn mirror_z() -> Op {
    Matrix3::from_diagonal(&Vector3::new(1, 1, -1))
}

/// Four-fold rotation about c: (h,k,l) -> (-k,h,l).
fn rot4_z() -> Op {
    Matrix3::new(0, -1, 0, 1, 0, 0, 0, 0, 1)
}

/// Three-fold rotation about c in the hexagonal setting: (h,k,l) -> (k,-h-k,l).
fn rot3_hex() -> Op {
    Matrix3::new(0, 1, 0, -1, -1, 0, 0, 0, 1)
}

/// In-plane two-fold of the hexagonal families: (h,k,l) -> (k,h,-l).
fn rot2_hex() -> Op {
    Matrix3::new(0, 1, 0, 1, 0, 0, 0, 0, -1)
}

/// Diagonal mirror of the hexagonal and cubic families: (h,k,l) -> (k,h,l).
fn mirror_diag() -> Op {
    Matrix3::new(0, 1, 0, 1, 0, 0, 0, 0, 1)
}

/// Body-diagonal three-fold of the cubic groups: (h,k,l) -> (l,h,k).
fn rot3_cubic() -> Op {
    Matrix3::new(0, 0, 1, 1, 0, 0, 0, 1, 0)
}

// ============================================================================
// POINT GROUPS
// ============================================================================

/// A crystallographic point group as an ordered list of 3x3 integer
/// operators acting on Miller indices.
///
/// The list always contains the identity, is closed under composition, and
/// its order divides 48. Groups are built by closing a small generator set,
/// so the operator order is deterministic for a given name.
#[derive(Debug, Clone)]
pub struct SymOpList {
    name: String,
    ops: Vec<Op>,
}

impl SymOpList {
    /// Looks up a point group by its canonical name (e.g. "mmm", "4/m",
    /// "-3m", "m-3m"). Monoclinic groups are b-unique; trigonal and
    /// hexagonal groups use hexagonal axes.
    pub fn from_name(name: &str) -> Result<Self, MergeError> {
        let generators: Vec<Op> = match name {
            "1" => vec![],
            "-1" => vec![inversion()],
            "2" => vec![rot2_y()],
            "m" => vec![mirror_y()],
            "2/m" => vec![rot2_y(), inversion()],
            "222" => vec![rot2_x(), rot2_z()],
            "mm2" => vec![mirror_x(), mirror_y()],
            "mmm" => vec![rot2_x(), rot2_z(), inversion()],
            "4" => vec![rot4_z()],
            "-4" => vec![-rot4_z()],
            "4/m" => vec![rot4_z(), inversion()],
            "422" => vec![rot4_z(), rot2_x()],
            "4mm" => vec![rot4_z(), mirror_x()],
            "-42m" => vec![-rot4_z(), rot2_x()],
            "4/mmm" => vec![rot4_z(), rot2_x(), inversion()],
            "3" => vec![rot3_hex()],
            "-3" => vec![rot3_hex(), inversion()],
            "32" => vec![rot3_hex(), rot2_hex()],
            "3m" => vec![rot3_hex(), mirror_diag()],
            "-3m" => vec![rot3_hex(), rot2_hex(), inversion()],
            "6" => vec![rot3_hex(), rot2_z()],
            "-6" => vec![rot3_hex(), mirror_z()],
            "6/m" => vec![rot3_hex(), rot2_z(), inversion()],
            "622" => vec![rot3_hex(), rot2_z(), rot2_hex()],
            "6mm" => vec![rot3_hex(), rot2_z(), mirror_diag()],
            "-62m" => vec![rot3_hex(), mirror_z(), rot2_hex()],
            "6/mmm" => vec![rot3_hex(), rot2_z(), rot2_hex(), inversion()],
            "23" => vec![rot2_x(), rot2_z(), rot3_cubic()],
            "m-3" => vec![rot2_x(), rot2_z(), rot3_cubic(), inversion()],
            "432" => vec![rot4_z(), rot3_cubic()],
            "-43m" => vec![-rot4_z(), rot3_cubic()],
            "m-3m" => vec![rot4_z(), rot3_cubic(), inversion()],
            _ => return Err(MergeError::UnknownPointGroup(name.to_string())),
        };

        let ops = close_under_composition(generators);
        debug_assert!(48 % ops.len() == 0, "group order must divide 48");

        Ok(Self {
            name: name.to_string(),
            ops,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Order of the group (number of operators, identity included).
    pub fn order(&self) -> usize {
        self.ops.len()
    }

    /// True if the group contains the pure inversion.
    pub fn is_centrosymmetric(&self) -> bool {
        self.ops.iter().any(|op| *op == inversion())
    }

    fn apply(op: &Op, hkl: Miller) -> Miller {
        let v = op * Vector3::new(hkl.h, hkl.k, hkl.l);
        Miller::new(v.x, v.y, v.z)
    }

    /// Enumerates the orbit of `hkl`, deduplicating fixed points. The orbit
    /// order follows the operator order (first occurrence wins), so it is
    /// stable across runs.
    pub fn orbit(&self, hkl: Miller) -> Vec<Miller> {
        let mut members = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let eq = Self::apply(op, hkl);
            if !members.contains(&eq) {
                members.push(eq);
            }
        }
        members
    }

    /// Orbit size; may be smaller than the group order when an operator
    /// stabilises the index (special positions).
    pub fn num_equivs(&self, hkl: Miller) -> usize {
        self.orbit(hkl).len()
    }

    /// The i-th orbit member, indexed in enumeration order.
    pub fn get_equiv(&self, hkl: Miller, i: usize) -> Option<Miller> {
        self.orbit(hkl).into_iter().nth(i)
    }

    /// A reflection is centric when some operator other than the pure
    /// inversion maps it onto its Friedel mate (-h,-k,-l). The inversion is
    /// excluded so that a centrosymmetric merging group still distinguishes
    /// true centric zones from reflections related only by Friedel symmetry:
    /// under "mmm", (0,0,4) is centric but (1,2,3) is not.
    pub fn is_centric(&self, hkl: Miller) -> bool {
        let mate = hkl.friedel();
        let inv = inversion();
        self.ops
            .iter()
            .any(|op| *op != inv && Self::apply(op, hkl) == mate)
    }

    /// The canonical asymmetric-unit representative of the orbit: its
    /// lexicographically greatest member under (h, k, l) tuple ordering.
    /// Deterministic and idempotent.
    pub fn asymmetric(&self, hkl: Miller) -> Miller {
        self.orbit(hkl)
            .into_iter()
            .max()
            .expect("orbit always contains the index itself")
    }
}

/// Closes a generator set under matrix composition. The identity is seeded
/// first; products are appended in discovery order, which makes the final
/// operator list deterministic for a fixed generator list.
fn close_under_composition(generators: Vec<Op>) -> Vec<Op> {
    let mut ops = vec![identity()];
    for g in generators {
        if !ops.contains(&g) {
            ops.push(g);
        }
    }

    loop {
        let mut grew = false;
        let snapshot = ops.clone();
        for a in &snapshot {
            for b in &snapshot {
                let product = a * b;
                if !ops.contains(&product) {
                    ops.push(product);
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
        assert!(ops.len() <= 48, "point group closure exceeded order 48");
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_orders() {
        for (name, order) in [
            ("1", 1),
            ("-1", 2),
            ("2/m", 4),
            ("222", 4),
            ("mmm", 8),
            ("4/m", 8),
            ("4/mmm", 16),
            ("-3", 6),
            ("-3m", 12),
            ("6/m", 12),
            ("6/mmm", 24),
            ("23", 12),
            ("m-3", 24),
            ("432", 24),
            ("m-3m", 48),
        ] {
            let sym = SymOpList::from_name(name).unwrap();
            assert_eq!(sym.order(), order, "order of {}", name);
        }
    }

    #[test]
    fn unknown_group_is_an_error() {
        assert!(matches!(
            SymOpList::from_name("frobnicated"),
            Err(MergeError::UnknownPointGroup(_))
        ));
    }

    #[test]
    fn orbit_of_general_position_matches_group_order() {
        let sym = SymOpList::from_name("mmm").unwrap();
        assert_eq!(sym.num_equivs(Miller::new(1, 2, 3)), 8);
        // Special position: (0,0,l) is stabilised by the in-plane operators.
        assert_eq!(sym.num_equivs(Miller::new(0, 0, 4)), 2);
    }

    #[test]
    fn centric_classification_under_mmm() {
        let sym = SymOpList::from_name("mmm").unwrap();
        assert!(sym.is_centric(Miller::new(0, 0, 4)));
        assert!(!sym.is_centric(Miller::new(1, 2, 3)));
    }

    #[test]
    fn centric_zone_of_mirror_group() {
        // In point group "m" (mirror perpendicular to b) the 0k0 axis is a
        // centric zone even though the group has no inversion.
        let sym = SymOpList::from_name("m").unwrap();
        assert!(sym.is_centric(Miller::new(0, 3, 0)));
        assert!(!sym.is_centric(Miller::new(1, 2, 3)));
    }

    #[test]
    fn asymmetric_representative_is_greatest_and_idempotent() {
        let sym = SymOpList::from_name("mmm").unwrap();
        let asym = sym.asymmetric(Miller::new(-1, 2, -3));
        assert_eq!(asym, Miller::new(1, 2, 3));
        assert_eq!(sym.asymmetric(asym), asym);

        // Every orbit member folds to the same representative.
        for eq in sym.orbit(Miller::new(1, 2, 3)) {
            assert_eq!(sym.asymmetric(eq), asym);
        }
    }

    #[test]
    fn orbit_stabiliser_accounting() {
        // Orbit size times stabiliser size equals the group order.
        let sym = SymOpList::from_name("4/mmm").unwrap();
        for hkl in [
            Miller::new(1, 2, 3),
            Miller::new(1, 1, 1),
            Miller::new(0, 0, 2),
            Miller::new(1, 0, 0),
        ] {
            let orbit = sym.num_equivs(hkl);
            assert_eq!(sym.order() % orbit, 0, "orbit of {:?}", hkl);
        }
    }
}
