//! Data reduction for qPCR and Qubit runs exported from a Bio-Rad CFX.
//!
//! The core of the crate is the qPCR analysis: a set of plates, one of which
//! (the reference plate) carries a dilution series of a standard of known
//! concentration, and all of which carry replicates of a shared reference
//! mix (`STD`). The analysis
//!
//!  1. corrects every plate for drift against the reference plate using the
//!     reference mix ([`normalize`](normalize::normalize)),
//!  2. fits a standard curve of Cq against log10(copies) on the reference
//!     plate ([`build_standard_curve`](calibration::build_standard_curve)),
//!  3. converts every replicate of every sample into copies/µL
//!     ([`quantify`](quantify::quantify)), and
//!  4. flags samples whose replicates disagree too much
//!     ([`evaluate`](qc::evaluate)).
//!
//! ```no_run
//! use cfxquant::prelude::*;
//!
//! let config = QpcrConfig {
//!     exponents_to_skip: vec![0.0],
//!     ..QpcrConfig::default()
//! };
//! let plates = PlateSet::from_folder("exported_data", "NIOZ385", &config.labels)
//!                  .expect("cannot load plates");
//! let dilutions = load_run_dilutions("exported_data", "NIOZ385")
//!                  .expect("bad dilution file");
//! let report = QpcrAnalysis::new(config)
//!                  .and_then(|a| a.run(&plates, dilutions.as_ref()))
//!                  .expect("analysis failed");
//!
//! for (sample, qc) in report.rows() {
//!     println!("{}\t{}\t{}", sample.sample, sample.concentration, qc.flags.any());
//! }
//! ```
//!
//! Two smaller tools share the plate-reader plumbing: [`qubit`] turns
//! Qubit fluorescence into DNA concentrations, and [`mapping`] builds
//! sequencing mapping files from primer tables.

pub mod analysis;
pub mod calibration;
pub mod error;
pub mod file;
pub mod mapping;
pub mod normalize;
pub mod numeric;
pub mod plate;
pub mod qc;
pub mod quantify;
pub mod qubit;
pub mod report;

pub use analysis::{load_run_dilutions, QpcrAnalysis, QpcrConfig, QpcrReport};
pub use error::CfxError;

pub mod prelude {
    pub use crate::analysis::{load_run_dilutions, QpcrAnalysis, QpcrConfig, QpcrReport};
    pub use crate::calibration::{CalibrationModel, SlopePolicy, StandardCurve};
    pub use crate::error::CfxError;
    pub use crate::plate::{LabelScheme, PlateSet};
    pub use crate::qc::QcThresholds;
    pub use crate::quantify::{Concentration, DilutionTable, SampleAggregate, SampleIssue};
    pub use crate::report::ReportWriter;
}
