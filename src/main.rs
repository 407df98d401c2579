use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use cfxquant::file::OutputFile;
use cfxquant::mapping::{MappingFile, PrimerTable, SampleSheet};
use cfxquant::prelude::*;
use cfxquant::qubit::{quantify_qubit, read_qubit_csv, SelectionPolicy};

const INFO: &str = "\
cfxquant: reduce CFX plate-reader exports
usage: cfxquant [--help] <subcommand>

Subcommands:

  qpcr:     normalize plates, fit the standard curve, quantify samples.
  qubit:    DNA concentrations from Qubit HS/BR assays.
  mapping:  build a sequencing mapping file from primer tables.

";

#[derive(Parser)]
#[clap(name = "cfxquant")]
#[clap(about = INFO)]
struct Cli {
    /// Increase log verbosity (-d debug, -dd trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse the qPCR plates of one analytical run.
    ///
    /// Reads every `<RUN>_*PCR_<n>.csv` in the folder (CFX custom export with
    /// at least `Sample` and `Cq` columns) and the optional
    /// `<RUN>_dilution_rates.csv` (`Sample`, `Dilution`). The plate holding the
    /// `10^x` dilution series is the reference plate; every plate must carry
    /// `STD` reference-mix wells.
    ///
    /// Example:
    ///
    ///  $ cfxquant qpcr --folder exported_data --run NIOZ385 --skip 0
    Qpcr {
        /// folder with the plate exports
        #[arg(long, required = true)]
        folder: PathBuf,
        /// analytical run code, the prefix of every export file
        #[arg(long, required = true)]
        run: String,
        /// output directory (default: <folder>/results)
        #[arg(long)]
        output: Option<PathBuf>,
        /// copies/µL of the standard at 10^0
        #[arg(long, default_value_t = 4.06)]
        std_copies: f64,
        /// dilution exponent to leave out of the curve fit (repeatable)
        #[arg(long = "skip")]
        skip: Vec<f64>,
        /// maximum acceptable CV% of Cq
        #[arg(long, default_value_t = 5.0)]
        threshold_cq: f64,
        /// maximum acceptable CV% of copies
        #[arg(long, default_value_t = 40.0)]
        threshold_copies: f64,
        /// id of the plate carrying the dilution series
        #[arg(long, default_value = "PCR_1")]
        reference: String,
        /// keep a standard curve whose slope is not negative (logged)
        #[arg(long, default_value_t = false)]
        allow_inverted_slope: bool,
        /// gzip the output tables
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Quantify Qubit HS/BR assays read on a CFX.
    Qubit {
        /// CFX export with `Sample` and `End RFU` columns
        #[arg(long, required = true)]
        input: PathBuf,
        /// the output file path (if not set, uses standard out)
        #[arg(long)]
        output: Option<PathBuf>,
        /// field delimiter of the input
        #[arg(long, default_value_t = ';')]
        delimiter: char,
        /// BR concentration (ng/µL) above which BR is reported
        #[arg(long, default_value_t = 5.0)]
        br_threshold: f64,
        /// HS concentration (ng/µL) above which BR is reported
        #[arg(long, default_value_t = 10.0)]
        hs_threshold: f64,
    },
    /// Build a mapping file for a barcoded sequencing run.
    Mapping {
        /// sample sheet with Forward_primer, Reverse_primer and metadata
        #[arg(long, required = true)]
        samples: PathBuf,
        /// forward primer table
        #[arg(long, required = true)]
        forward_primers: PathBuf,
        /// reverse primer table
        #[arg(long, required = true)]
        reverse_primers: PathBuf,
        /// run id, the prefix of every sample id
        #[arg(long, required = true)]
        run_id: String,
        /// the output file path (if not set, uses standard out)
        #[arg(long)]
        output: Option<PathBuf>,
        /// field delimiter of the inputs
        #[arg(long, default_value_t = ';')]
        delimiter: char,
    },
}

fn delimiter_byte(delimiter: char) -> Result<u8, CfxError> {
    u8::try_from(delimiter).map_err(|_| {
        CfxError::InvalidConfig(format!("delimiter '{}' is not a single byte", delimiter))
    })
}

/// Write a table to `output`, or to standard out if unset.
fn emit<F>(output: Option<&Path>, write: F) -> Result<(), CfxError>
where
    F: FnOnce(&mut dyn Write) -> Result<(), CfxError>,
{
    match output {
        Some(path) => {
            let mut writer = OutputFile::new(path, None).open()?;
            write(&mut writer)?;
            writer.finish()?;
        }
        None => {
            let mut writer = io::stdout().lock();
            write(&mut writer)?;
            writer.flush()?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_qpcr(
    folder: &Path,
    run: &str,
    output: Option<&Path>,
    std_copies: f64,
    skip: &[f64],
    threshold_cq: f64,
    threshold_copies: f64,
    reference: &str,
    allow_inverted_slope: bool,
    gzip: bool,
) -> Result<(), CfxError> {
    let config = QpcrConfig {
        std_curve_copies: std_copies,
        exponents_to_skip: skip.to_vec(),
        thresholds: QcThresholds {
            threshold_cq,
            threshold_copies,
        },
        reference_plate: reference.to_string(),
        slope_policy: if allow_inverted_slope {
            SlopePolicy::Warn
        } else {
            SlopePolicy::Reject
        },
        ..QpcrConfig::default()
    };
    let analysis = QpcrAnalysis::new(config)?;
    let plates = PlateSet::from_folder(folder, run, &analysis.config().labels)?;
    let dilutions = load_run_dilutions(folder, run)?;
    let report = analysis.run(&plates, dilutions.as_ref())?;

    let out_dir = output.map_or_else(|| folder.join("results"), Path::to_path_buf);
    let mut writer = ReportWriter::new(&out_dir, run);
    writer.compress = gzip;
    let written = writer.write_all(&report)?;

    let model = &report.curve.model;
    println!("{}", model.equation());
    println!(
        "efficiency = {:.0}%  R² = {:.4}",
        model.efficiency, model.r_squared
    );
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_qubit(
    input: &Path,
    output: Option<&Path>,
    delimiter: char,
    policy: SelectionPolicy,
) -> Result<(), CfxError> {
    let readings = read_qubit_csv(input, delimiter_byte(delimiter)?)?;
    let result = quantify_qubit(&readings, &policy)?;
    emit(output, |w| result.write_tsv(w))
}

fn run_mapping(
    samples: &Path,
    forward_primers: &Path,
    reverse_primers: &Path,
    run_id: &str,
    output: Option<&Path>,
    delimiter: char,
) -> Result<(), CfxError> {
    let delimiter = delimiter_byte(delimiter)?;
    let sheet = SampleSheet::from_csv(samples, delimiter)?;
    let forward = PrimerTable::forward_from_csv(forward_primers, delimiter)?;
    let reverse = PrimerTable::reverse_from_csv(reverse_primers, delimiter)?;
    let mapping = MappingFile::build(&sheet, &forward, &reverse, run_id)?;
    emit(output, |w| mapping.write_tsv(w))
}

fn init_logging(debug: u8) {
    let default_level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn run() -> Result<(), CfxError> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    match &cli.command {
        Some(Commands::Qpcr {
            folder,
            run,
            output,
            std_copies,
            skip,
            threshold_cq,
            threshold_copies,
            reference,
            allow_inverted_slope,
            gzip,
        }) => run_qpcr(
            folder,
            run,
            output.as_deref(),
            *std_copies,
            skip,
            *threshold_cq,
            *threshold_copies,
            reference,
            *allow_inverted_slope,
            *gzip,
        ),
        Some(Commands::Qubit {
            input,
            output,
            delimiter,
            br_threshold,
            hs_threshold,
        }) => run_qubit(
            input,
            output.as_deref(),
            *delimiter,
            SelectionPolicy {
                br_threshold: *br_threshold,
                hs_threshold: *hs_threshold,
            },
        ),
        Some(Commands::Mapping {
            samples,
            forward_primers,
            reverse_primers,
            run_id,
            output,
            delimiter,
        }) => run_mapping(
            samples,
            forward_primers,
            reverse_primers,
            run_id,
            output.as_deref(),
            *delimiter,
        ),
        None => {
            println!("{}\n", INFO);
            std::process::exit(1);
        }
    }
}

fn main() {
    match run() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
