//! An end-to-end qPCR analytical run.
//!
//! Plates are normalized to the reference plate, the standard curve is fit
//! on the corrected reference plate, samples are quantified against it and
//! finally checked for replicate precision. Any failure of the
//! normalization or the curve aborts the run; per-sample problems are
//! recorded on the sample and the run carries on.
//!
//! ```no_run
//! use cfxquant::prelude::*;
//! let config = QpcrConfig::default();
//! let plates = PlateSet::from_folder("exported_data", "NIOZ385", &config.labels)
//!                  .expect("cannot load plates");
//! let report = QpcrAnalysis::new(config)
//!                  .expect("invalid configuration")
//!                  .run(&plates, None)
//!                  .expect("analysis failed");
//! println!("{}", report.curve.model.equation());
//! ```
//!
use std::path::Path;
use tracing::{info, warn};

use crate::calibration::{build_standard_curve, CurveSettings, SlopePolicy, StandardCurve};
use crate::error::CfxError;
use crate::normalize::{normalize, Normalized};
use crate::plate::{LabelScheme, PlateSet};
use crate::qc::{evaluate, QcResult, QcThresholds};
use crate::quantify::{quantify, DilutionTable, SampleAggregate};

/// Settings of one analytical run.
#[derive(Debug, Clone, PartialEq)]
pub struct QpcrConfig {
    /// Copies/µL of the standard at exponent 0.
    pub std_curve_copies: f64,
    /// Dilution exponents left out of the standard curve fit.
    pub exponents_to_skip: Vec<f64>,
    pub thresholds: QcThresholds,
    /// Plate carrying the dilution series; all plates are scaled to it.
    pub reference_plate: String,
    pub labels: LabelScheme,
    pub slope_policy: SlopePolicy,
}

impl Default for QpcrConfig {
    fn default() -> Self {
        Self {
            std_curve_copies: 4.06,
            exponents_to_skip: Vec::new(),
            thresholds: QcThresholds::default(),
            reference_plate: "PCR_1".to_string(),
            labels: LabelScheme::default(),
            slope_policy: SlopePolicy::Reject,
        }
    }
}

impl QpcrConfig {
    pub fn validate(&self) -> Result<(), CfxError> {
        if !(self.std_curve_copies > 0.0 && self.std_curve_copies.is_finite()) {
            return Err(CfxError::InvalidConfig(format!(
                "std_curve_copies must be positive, got {}",
                self.std_curve_copies
            )));
        }
        if let Some(bad) = self.exponents_to_skip.iter().find(|e| !e.is_finite()) {
            return Err(CfxError::InvalidConfig(format!(
                "exponent to skip must be finite, got {}",
                bad
            )));
        }
        if self.reference_plate.is_empty() {
            return Err(CfxError::InvalidConfig(
                "reference_plate must not be empty".to_string(),
            ));
        }
        if self.labels.reference_token.is_empty() || self.labels.dilution_prefix.is_empty() {
            return Err(CfxError::InvalidConfig(
                "sample label tokens must not be empty".to_string(),
            ));
        }
        self.thresholds.validate()
    }

    fn curve_settings(&self) -> CurveSettings {
        CurveSettings {
            std_curve_copies: self.std_curve_copies,
            exponents_to_skip: self.exponents_to_skip.clone(),
            slope_policy: self.slope_policy,
        }
    }
}

/// Everything an analytical run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct QpcrReport {
    pub config: QpcrConfig,
    pub normalized: Normalized,
    pub curve: StandardCurve,
    pub samples: Vec<SampleAggregate>,
    /// QC verdicts, aligned with `samples`.
    pub qc: Vec<QcResult>,
}

impl QpcrReport {
    /// Samples paired with their QC verdicts.
    pub fn rows(&self) -> impl Iterator<Item = (&SampleAggregate, &QcResult)> {
        self.samples.iter().zip(self.qc.iter())
    }

    /// The largest replicate count of any sample.
    pub fn max_replicates(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.n_replicates())
            .max()
            .unwrap_or(0)
    }
}

/// Runs the qPCR pipeline with a validated configuration.
#[derive(Debug, Clone)]
pub struct QpcrAnalysis {
    config: QpcrConfig,
}

impl QpcrAnalysis {
    pub fn new(config: QpcrConfig) -> Result<Self, CfxError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &QpcrConfig {
        &self.config
    }

    pub fn run(
        &self,
        plates: &PlateSet,
        dilutions: Option<&DilutionTable>,
    ) -> Result<QpcrReport, CfxError> {
        if plates.is_empty() {
            return Err(CfxError::NoPlates("plate set is empty".to_string()));
        }
        let normalized = normalize(plates, &self.config.reference_plate)?;
        let reference = normalized
            .reference()
            .ok_or_else(|| CfxError::MissingReferencePlate(self.config.reference_plate.clone()))?;
        let curve = build_standard_curve(reference, &self.config.curve_settings())?;
        let samples = quantify(&normalized, &curve.model, dilutions)?;
        let qc = evaluate(&samples, &self.config.thresholds);
        info!(
            samples = samples.len(),
            flagged = qc.iter().filter(|q| q.flags.any()).count(),
            "analysis complete"
        );
        Ok(QpcrReport {
            config: self.config.clone(),
            normalized,
            curve,
            samples,
            qc,
        })
    }
}

/// Load the optional `<run_code>_dilution_rates.csv` of a run folder.
pub fn load_run_dilutions<P: AsRef<Path>>(
    folder: P,
    run_code: &str,
) -> Result<Option<DilutionTable>, CfxError> {
    let path = folder
        .as_ref()
        .join(format!("{}_dilution_rates.csv", run_code));
    if !path.exists() {
        warn!(
            path = %path.display(),
            "no dilution file; all samples are treated as undiluted"
        );
        return Ok(None);
    }
    Ok(Some(DilutionTable::from_csv(&path)?))
}
