use crate::core::cell::UnitCell;
use crate::core::crystal::Crystal;
use crate::core::reflection::ReflList;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes a merged reflection list as text: a header documenting the unit
/// cell (nm and degrees) and point group, then one reflection per line as
/// `h k l I sigma(I) redundancy` with six-decimal floats. The companion
/// reader `parser::read_reflection_list` accepts exactly this form.
pub fn write_merged(
    path: &Path,
    list: &ReflList,
    cell: &UnitCell,
    point_group: &str,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Could not create merged list: {:?}", path))?;
    let mut out = BufWriter::new(file);

    let (a, b, c, alpha, beta, gamma) = cell.parameters();
    writeln!(
        out,
        "# cell {:.6} {:.6} {:.6} nm  {:.6} {:.6} {:.6} deg  point group {}",
        a * 1.0e9,
        b * 1.0e9,
        c * 1.0e9,
        alpha,
        beta,
        gamma,
        point_group
    )?;
    writeln!(out, "#    h    k    l            I     sigma(I)  redundancy")?;

    for (hkl, refl) in list.iter() {
        writeln!(
            out,
            "{:6} {:4} {:4} {:12.6} {:12.6} {:6}",
            hkl.h, hkl.k, hkl.l, refl.intensity, refl.sigma, refl.redundancy
        )?;
    }

    out.flush()?;
    Ok(())
}

/// Dumps per-crystal parameters, one line per crystal: index, OSF,
/// divergence, and the status character ('-' OK, 'N' flagged).
pub fn write_crystal_params(path: &Path, crystals: &[Crystal]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Could not create parameter dump: {:?}", path))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "# idx          OSF    divergence  status")?;
    for (idx, crystal) in crystals.iter().enumerate() {
        writeln!(
            out,
            "{:5} {:12.6} {:13.6e}       {}",
            idx,
            crystal.osf,
            crystal.divergence,
            crystal.status.flag_char()
        )?;
    }

    out.flush()?;
    Ok(())
}
