use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use serial_crystal_merger::{
    compute_fom, parser, shell_statistics, writer, FomKind, FomSelection, MergeConfig,
    MergeDriver, ModelChoice, ReflList, ResolutionShells, SymOpList, UnitCell,
};

#[derive(Parser)]
#[command(author, version, about = "Serial crystallography merging engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scales, post-refines and merges a crystal stream.
    Merge {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Point group used for asymmetric folding.
        #[arg(short = 'y', long, default_value = "1")]
        symmetry: String,

        /// Outer scale + refine cycles.
        #[arg(long, default_value_t = 10)]
        iterations: usize,

        /// Hold all scale factors at 1.0 (Monte-Carlo merge).
        #[arg(long)]
        no_scale: bool,

        /// Partiality model: unity or sphere.
        #[arg(long, default_value = "unity")]
        model: String,

        /// Drop merged reflections below this redundancy.
        #[arg(long, default_value_t = 2)]
        min_measurements: u32,

        /// External reference list to scale against.
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Skip the polarisation correction.
        #[arg(long)]
        no_polarisation: bool,

        /// Worker threads for post-refinement.
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Also dump per-crystal parameters to this file.
        #[arg(long)]
        params_dump: Option<PathBuf>,
    },

    /// Compares two merged lists with a figure of merit.
    Compare {
        list1: PathBuf,
        list2: PathBuf,

        /// Unit cell as "a,b,c,alpha,beta,gamma" (nm and degrees).
        #[arg(long)]
        cell: String,

        /// FOM kind: r1i, r1f, r2, rsplit, cc, ccstar, ccano, crdano,
        /// rano, rano/rsplit, d1sig, d2sig.
        #[arg(long, default_value = "rsplit")]
        fom: String,

        #[arg(long, default_value_t = 10)]
        shells: usize,

        /// Point group (required for the anomalous kinds).
        #[arg(short = 'y', long)]
        symmetry: Option<String>,

        /// Reject pairs with I < cutoff·sigma in either list.
        #[arg(long)]
        sigma_cutoff: Option<f64>,

        /// Reject pairs below this redundancy.
        #[arg(long, default_value_t = 0)]
        min_redundancy: u32,

        /// Skip the Wilson scaling of list 2 onto list 1.
        #[arg(long)]
        no_wilson: bool,

        /// Also print per-shell statistics of list 1.
        #[arg(long)]
        stats: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let start_time = Instant::now();

    match cli.command {
        Commands::Merge {
            input,
            output,
            symmetry,
            iterations,
            no_scale,
            model,
            min_measurements,
            reference,
            no_polarisation,
            threads,
            params_dump,
        } => {
            println!("--- Serial Crystallography Merger ---");

            // 1. Loading
            println!("Reading crystal stream from {:?}...", input);
            let loaded = parser::read_stream(&input)?;
            println!(
                "-> Loaded {} crystals ({} records rejected).",
                loaded.crystals.len(),
                loaded.n_rejected
            );
            if loaded.crystals.is_empty() {
                anyhow::bail!("no usable crystals in the stream");
            }

            let reference_list: Option<ReflList> = match &reference {
                Some(path) => {
                    println!("Reading reference list from {:?}...", path);
                    Some(parser::read_reflection_list(path)?)
                }
                None => None,
            };

            // 2. Configuration
            let config = MergeConfig {
                iterations,
                no_scale,
                model: ModelChoice::from_name(&model)?,
                min_measurements,
                polarisation: !no_polarisation,
                point_group: symmetry.clone(),
                threads,
                ..MergeConfig::default()
            };
            let sym = SymOpList::from_name(&config.point_group)?;
            let pmodel = config.model.build();

            // 3. Merging
            println!(
                "Merging with point group {} and the {} model...",
                symmetry, model
            );
            let cancel = AtomicBool::new(false);
            let mut driver = MergeDriver::new(
                loaded.crystals,
                pmodel.as_ref(),
                &sym,
                reference_list.as_ref(),
                config.driver_options(),
            );

            let summary = match driver.run(&cancel) {
                Ok(summary) => summary,
                Err(e) => {
                    // Flush the last completed iteration before bailing.
                    if let Some(last) = driver.take_last_merged() {
                        let crystals = driver.crystals();
                        if let Some(first) = crystals.first() {
                            eprintln!("Fatal: {}; writing last completed merge.", e);
                            writer::write_merged(&output, &last, &first.cell, &symmetry)?;
                        }
                    }
                    return Err(e.into());
                }
            };

            // 4. Reporting
            for report in &summary.reports {
                let flagged =
                    report.n_no_refinement + report.n_solver_failed + report.n_lost;
                println!(
                    "  iteration {:2}: {:5} active, {:8} observations, max shift {:.2e}{}",
                    report.iteration,
                    report.n_active,
                    report.n_observations,
                    report.max_shift,
                    match report.r_reference {
                        Some(r) => format!(", R(ref) {:.4}", r),
                        None => String::new(),
                    }
                );
                if flagged > 0 {
                    println!(
                        "               {} flagged: {} no-ref, {} solve-failed, {} lost",
                        flagged, report.n_no_refinement, report.n_solver_failed, report.n_lost
                    );
                }
            }

            // 5. Output
            let crystals = driver.into_crystals();
            let cell = &crystals
                .first()
                .expect("at least one crystal was loaded")
                .cell;
            println!(
                "Writing {} merged reflections to {:?}...",
                summary.merged.len(),
                output
            );
            writer::write_merged(&output, &summary.merged, cell, &symmetry)?;

            if let Some(path) = params_dump {
                println!("Writing per-crystal parameters to {:?}...", path);
                writer::write_crystal_params(&path, &crystals)?;
            }

            println!("Done in {:.2?}", start_time.elapsed());
        }

        Commands::Compare {
            list1,
            list2,
            cell,
            fom,
            shells,
            symmetry,
            sigma_cutoff,
            min_redundancy,
            no_wilson,
            stats,
        } => {
            println!("--- Figure of Merit ---");

            let a = parser::read_reflection_list(&list1)?;
            let b = parser::read_reflection_list(&list2)?;
            println!("-> {} and {} reflections loaded.", a.len(), b.len());

            let cell = parse_cell(&cell)?;
            let kind = FomKind::from_name(&fom)?;
            let sym = match &symmetry {
                Some(name) => Some(SymOpList::from_name(name)?),
                None => None,
            };

            let shell_set = ResolutionShells::covering(
                a.iter().map(|(hkl, _)| cell.resolution(hkl)),
                shells,
            )?;

            let selection = FomSelection {
                sigma_cutoff,
                min_redundancy,
                ..FomSelection::default()
            };
            let result = compute_fom(
                &a,
                &b,
                &cell,
                &shell_set,
                kind,
                sym.as_ref(),
                &selection,
                !no_wilson,
            )?;

            if let Some(wilson) = result.wilson {
                println!(
                    "Wilson scaling of list 2: G = {:.4}, B = {:.4e} m^2",
                    wilson.scale, wilson.b_factor
                );
            }

            println!("  shell   centre d* (1/nm)      n    {}", result.kind);
            for (i, shell) in result.shells.iter().enumerate() {
                match shell.value {
                    Some(v) => println!(
                        "  {:5} {:18.4} {:6} {:10.4}",
                        i,
                        shell.dstar_centre * 1.0e-9,
                        shell.n,
                        v
                    ),
                    None => println!(
                        "  {:5} {:18.4} {:6}          -",
                        i,
                        shell.dstar_centre * 1.0e-9,
                        shell.n
                    ),
                }
            }
            match result.overall {
                Some(v) => println!("Overall {} = {:.4} over {} pairs", result.kind, v, result.n_total),
                None => println!("Overall {}: undefined", result.kind),
            }

            if stats {
                let sym_for_stats = match &sym {
                    Some(s) => s.clone(),
                    None => SymOpList::from_name("1")?,
                };
                println!("  shell   unique  possible   compl.   <I/sigma>   redundancy");
                for (i, row) in shell_statistics(&a, &cell, &shell_set, &sym_for_stats)
                    .iter()
                    .enumerate()
                {
                    println!(
                        "  {:5} {:8} {:9} {:8.3} {:11.2} {:12.2}",
                        i,
                        row.n_unique,
                        row.n_possible,
                        row.completeness,
                        row.mean_i_over_sigma,
                        row.mean_redundancy
                    );
                }
            }

            println!("Done in {:.2?}", start_time.elapsed());
        }
    }

    Ok(())
}

/// Parses "a,b,c,alpha,beta,gamma" with lengths in nm and angles in
/// degrees into a metre-based cell.
fn parse_cell(text: &str) -> Result<UnitCell> {
    let values: Vec<f64> = text
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("bad cell '{}': {}", text, e))?;
    if values.len() != 6 {
        anyhow::bail!("cell needs six comma-separated values, got {}", values.len());
    }
    Ok(UnitCell::from_parameters(
        values[0] * 1.0e-9,
        values[1] * 1.0e-9,
        values[2] * 1.0e-9,
        values[3],
        values[4],
        values[5],
    )?)
}
