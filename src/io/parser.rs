use crate::core::cell::UnitCell;
use crate::core::crystal::Crystal;
use crate::core::reflection::{Miller, ReflList};
use crate::error::MergeError;
use anyhow::{Context, Result};
use log::warn;
use std::fs;
use std::path::Path;

/// Result of loading a crystal stream: the usable crystals plus the count
/// of records that had to be rejected.
#[derive(Debug)]
pub struct LoadOutcome {
    pub crystals: Vec<Crystal>,
    pub n_rejected: usize,
}

/// Parses a crystal stream.
///
/// The format is line oriented: each crystal is bracketed by `crystal` and
/// `end crystal`, carries `cell` (a b c in metres, angles in degrees) and
/// `lambda` (metres) plus optional per-shot parameters, and lists its
/// reflections between `reflections` and `end reflections` as
/// `h k l I sigma [fs ss]` rows. Lines starting with `#` are comments.
///
/// A malformed crystal record is rejected with a warning and the rest of
/// the stream is still loaded; only an unreadable file is fatal.
pub fn read_stream(path: &Path) -> Result<LoadOutcome> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Could not read crystal stream: {:?}", path))?;
    let lines: Vec<&str> = contents.lines().map(str::trim).collect();

    let mut crystals = Vec::new();
    let mut n_rejected = 0;

    let mut i = 0;
    while i < lines.len() {
        if lines[i] != "crystal" {
            i += 1;
            continue;
        }

        // Find the end of this block first so a bad record cannot derail
        // the scan position.
        let block_start = i + 1;
        let block_end = lines[block_start..]
            .iter()
            .position(|l| *l == "end crystal")
            .map(|offset| block_start + offset);
        let block_end = match block_end {
            Some(end) => end,
            None => {
                warn!("unterminated crystal block at line {}; dropping the tail", i + 1);
                n_rejected += 1;
                break;
            }
        };

        match parse_crystal_block(&lines[block_start..block_end]) {
            Ok(crystal) => crystals.push(crystal),
            Err(e) => {
                warn!("rejecting crystal record at line {}: {}", i + 1, e);
                n_rejected += 1;
            }
        }
        i = block_end + 1;
    }

    Ok(LoadOutcome {
        crystals,
        n_rejected,
    })
}

fn parse_crystal_block(lines: &[&str]) -> Result<Crystal, MergeError> {
    let mut cell: Option<UnitCell> = None;
    let mut wavelength: Option<f64> = None;
    let mut osf: Option<f64> = None;
    let mut profile_radius: Option<f64> = None;
    let mut mosaicity: Option<f64> = None;
    let mut divergence: Option<f64> = None;
    let mut bandwidth: Option<f64> = None;
    let mut ident: Option<String> = None;
    let mut reflections = ReflList::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.is_empty() || line.starts_with('#') {
            i += 1;
            continue;
        }

        let (key, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };

        match key {
            "cell" => {
                if cell.is_some() {
                    return Err(MergeError::Input("duplicate cell in crystal record".into()));
                }
                let values = parse_floats(rest, 6)?;
                cell = Some(UnitCell::from_parameters(
                    values[0], values[1], values[2], values[3], values[4], values[5],
                )?);
            }
            "lambda" => wavelength = Some(parse_floats(rest, 1)?[0]),
            "osf" => osf = Some(parse_floats(rest, 1)?[0]),
            "profile_radius" => profile_radius = Some(parse_floats(rest, 1)?[0]),
            "mosaicity" => mosaicity = Some(parse_floats(rest, 1)?[0]),
            "divergence" => divergence = Some(parse_floats(rest, 1)?[0]),
            "bandwidth" => bandwidth = Some(parse_floats(rest, 1)?[0]),
            "ident" => ident = Some(rest.to_string()),
            "reflections" => {
                // Consume rows until the closing marker.
                i += 1;
                while i < lines.len() && lines[i] != "end reflections" {
                    if !lines[i].is_empty() && !lines[i].starts_with('#') {
                        parse_reflection_row(lines[i], &mut reflections)?;
                    }
                    i += 1;
                }
                if i == lines.len() {
                    return Err(MergeError::Input("unterminated reflections block".into()));
                }
            }
            other => {
                return Err(MergeError::Input(format!(
                    "unrecognised crystal field '{}'",
                    other
                )));
            }
        }
        i += 1;
    }

    let cell = cell.ok_or_else(|| MergeError::Input("crystal record without a cell".into()))?;
    let wavelength = wavelength
        .ok_or_else(|| MergeError::Input("crystal record without beam parameters".into()))?;
    if wavelength <= 0.0 {
        return Err(MergeError::Input(format!(
            "non-physical wavelength {}",
            wavelength
        )));
    }

    let mut crystal = Crystal::new(cell, wavelength);
    if let Some(v) = osf {
        if v <= 0.0 {
            return Err(MergeError::Input(format!("non-positive OSF {}", v)));
        }
        crystal.osf = v;
    }
    if let Some(v) = profile_radius {
        crystal.profile_radius = v;
    }
    if let Some(v) = mosaicity {
        crystal.mosaicity = v;
    }
    if let Some(v) = divergence {
        crystal.divergence = v;
    }
    if let Some(v) = bandwidth {
        crystal.bandwidth = v;
    }
    crystal.ident = ident;
    crystal.reflections = reflections;
    Ok(crystal)
}

fn parse_reflection_row(line: &str, list: &mut ReflList) -> Result<(), MergeError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 5 && parts.len() != 7 {
        return Err(MergeError::Input(format!(
            "reflection row needs 5 or 7 fields, got {}: '{}'",
            parts.len(),
            line
        )));
    }

    let h = parse_int(parts[0])?;
    let k = parse_int(parts[1])?;
    let l = parse_int(parts[2])?;
    let refl = list.add(Miller::new(h, k, l));
    refl.intensity = parse_float(parts[3])?;
    refl.sigma = parse_float(parts[4])?;
    if parts.len() == 7 {
        refl.fs = parse_float(parts[5])?;
        refl.ss = parse_float(parts[6])?;
    }
    Ok(())
}

/// Reads a merged reflection list in the writer's text form:
/// `h k l I sigma redundancy` rows, `#`-prefixed header lines skipped.
pub fn read_reflection_list(path: &Path) -> Result<ReflList> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Could not read reflection list: {:?}", path))?;

    let mut list = ReflList::new();
    for (line_no, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 6 {
            anyhow::bail!(
                "line {}: expected 'h k l I sigma redundancy', got '{}'",
                line_no + 1,
                line
            );
        }
        let hkl = Miller::new(parse_int(parts[0])?, parse_int(parts[1])?, parse_int(parts[2])?);
        let refl = list.add(hkl);
        refl.intensity = parse_float(parts[3])?;
        refl.sigma = parse_float(parts[4])?;
        refl.redundancy = parts[5]
            .parse::<u32>()
            .map_err(|_| MergeError::Input(format!("bad redundancy '{}'", parts[5])))?;
    }
    Ok(list)
}

fn parse_int(s: &str) -> Result<i32, MergeError> {
    s.parse::<i32>()
        .map_err(|_| MergeError::Input(format!("bad integer '{}'", s)))
}

fn parse_float(s: &str) -> Result<f64, MergeError> {
    s.parse::<f64>()
        .map_err(|_| MergeError::Input(format!("bad float '{}'", s)))
}

fn parse_floats(s: &str, n: usize) -> Result<Vec<f64>, MergeError> {
    let values: Vec<f64> = s
        .split_whitespace()
        .map(parse_float)
        .collect::<Result<_, _>>()?;
    if values.len() != n {
        return Err(MergeError::Input(format!(
            "expected {} values, got {} in '{}'",
            n,
            values.len(),
            s
        )));
    }
    Ok(values)
}
