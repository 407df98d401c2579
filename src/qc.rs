//! Replicate precision checks.
//!
//! CV% is computed with the sample standard deviation for both Cq and copy
//! number. A sample with fewer than two amplified replicates has no CV and
//! is never flagged.
//!
use tracing::info;

use crate::error::CfxError;
use crate::quantify::SampleAggregate;

/// Maximum acceptable CV% for Cq and for copy number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QcThresholds {
    pub threshold_cq: f64,
    pub threshold_copies: f64,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            threshold_cq: 5.0,
            threshold_copies: 40.0,
        }
    }
}

impl QcThresholds {
    pub fn validate(&self) -> Result<(), CfxError> {
        for (name, value) in [
            ("threshold_cq", self.threshold_cq),
            ("threshold_copies", self.threshold_copies),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(CfxError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Threshold flags of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QcFlags {
    pub exceeds_cq_threshold: bool,
    pub exceeds_copies_threshold: bool,
}

impl QcFlags {
    pub fn any(&self) -> bool {
        self.exceeds_cq_threshold || self.exceeds_copies_threshold
    }
}

/// The precision verdict for one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct QcResult {
    pub sample: String,
    pub cv_cq: Option<f64>,
    pub cv_copies: Option<f64>,
    pub flags: QcFlags,
}

fn exceeds(cv: Option<f64>, threshold: f64) -> bool {
    cv.map_or(false, |cv| cv > threshold)
}

/// Flag every sample whose CV% exceeds a threshold.
pub fn evaluate(samples: &[SampleAggregate], thresholds: &QcThresholds) -> Vec<QcResult> {
    samples
        .iter()
        .map(|s| {
            let cv_cq = s.cq_stats.cv_percent;
            let cv_copies = s.copies_stats.cv_percent;
            let flags = QcFlags {
                exceeds_cq_threshold: exceeds(cv_cq, thresholds.threshold_cq),
                exceeds_copies_threshold: exceeds(cv_copies, thresholds.threshold_copies),
            };
            if flags.any() {
                info!(
                    sample = %s.sample,
                    cv_cq = ?cv_cq,
                    cv_copies = ?cv_copies,
                    "replicate CV above threshold"
                );
            }
            QcResult {
                sample: s.sample.clone(),
                cv_cq,
                cv_copies,
                flags,
            }
        })
        .collect()
}
