//! DNA concentrations from Qubit dsDNA assays read on a CFX plate reader.
//!
//! Two assays may share a plate: high sensitivity (HS) and broad range
//! (BR). Each has its own standards, labelled `HS <ng/µL>` or
//! `BR <ng/µL>`, and its own samples, labelled `HS_<id>` or `BR_<id>`.
//! End-point fluorescence is linear in DNA concentration, so each assay
//! gets a straight-line fit and sample concentrations are read off it.
//!
use indexmap::IndexMap;
use ndarray::Array1;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::error::CfxError;
use crate::file::InputFile;
use crate::numeric::{linear_regression, LinearFit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assay {
    HighSensitivity,
    BroadRange,
}

impl Assay {
    pub fn prefix(&self) -> &'static str {
        match self {
            Assay::HighSensitivity => "HS",
            Assay::BroadRange => "BR",
        }
    }
}

impl fmt::Display for Assay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// One well of a Qubit plate read.
#[derive(Debug, Clone, PartialEq)]
pub struct QubitReading {
    pub sample: String,
    pub rfu: f64,
}

#[derive(Debug, Deserialize)]
struct QubitRecord {
    #[serde(rename = "Sample", default)]
    sample: String,
    #[serde(rename = "End RFU", default)]
    rfu: Option<f64>,
}

/// Read `Sample` and `End RFU` from a CFX export.
///
/// Unused wells (empty sample name) are skipped; a named well without a
/// fluorescence value is an error.
pub fn read_qubit_csv<P: AsRef<Path>>(
    filepath: P,
    delimiter: u8,
) -> Result<Vec<QubitReading>, CfxError> {
    let mut rdr = InputFile::new(filepath.as_ref()).csv_reader(delimiter)?;
    let mut readings = Vec::new();
    for result in rdr.deserialize() {
        let record: QubitRecord = result?;
        if record.sample.is_empty() {
            continue;
        }
        let rfu = record.rfu.ok_or_else(|| {
            CfxError::ParseError(format!("sample '{}' has no End RFU value", record.sample))
        })?;
        readings.push(QubitReading {
            sample: record.sample,
            rfu,
        });
    }
    Ok(readings)
}

/// What a Qubit well holds.
#[derive(Debug, Clone, PartialEq)]
enum QubitLabel<'a> {
    Standard { assay: Assay, ng_per_ul: f64 },
    Sample { assay: Assay, id: &'a str },
    Other,
}

fn classify(label: &str) -> Result<QubitLabel<'_>, CfxError> {
    for assay in [Assay::HighSensitivity, Assay::BroadRange] {
        let Some(rest) = label.strip_prefix(assay.prefix()) else {
            continue;
        };
        if let Some(id) = rest.strip_prefix('_') {
            return Ok(QubitLabel::Sample { assay, id });
        }
        if rest.starts_with(' ') {
            let value = rest.split_whitespace().next().unwrap_or("");
            let ng_per_ul: f64 = value.parse().map_err(|_| {
                CfxError::ParseError(format!("standard '{}' has no concentration", label))
            })?;
            return Ok(QubitLabel::Standard { assay, ng_per_ul });
        }
    }
    Ok(QubitLabel::Other)
}

/// The standard curve of one assay: `RFU = intercept + slope × ng/µL`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssayCurve {
    pub assay: Assay,
    /// `(ng/µL, RFU)` of each standard.
    pub standards: Vec<(f64, f64)>,
    pub fit: LinearFit,
}

impl AssayCurve {
    /// ng/µL for a fluorescence reading.
    pub fn concentration(&self, rfu: f64) -> f64 {
        (rfu - self.fit.intercept) / self.fit.slope
    }

    pub fn equation(&self) -> String {
        format!("y = {:.0}X + {:.0}", self.fit.slope, self.fit.intercept)
    }
}

fn fit_assay(assay: Assay, standards: Vec<(f64, f64)>) -> Result<AssayCurve, CfxError> {
    if standards.len() < 2 {
        return Err(CfxError::InsufficientStandards {
            plate: format!("{} standards", assay),
            usable: standards.len(),
        });
    }
    let x = Array1::from_iter(standards.iter().map(|s| s.0));
    let y = Array1::from_iter(standards.iter().map(|s| s.1));
    let fit = linear_regression(&x, &y)
        .filter(|fit| fit.slope != 0.0 && fit.slope.is_finite())
        .ok_or_else(|| {
            CfxError::DegenerateCalibration(format!("{} standard curve has no slope", assay))
        })?;
    Ok(AssayCurve {
        assay,
        standards,
        fit,
    })
}

/// How to choose between HS and BR when a sample was measured with both.
///
/// BR is preferred once either estimate is above the HS assay's useful
/// range: BR above `br_threshold` or HS above `hs_threshold` (ng/µL).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionPolicy {
    pub br_threshold: f64,
    pub hs_threshold: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            br_threshold: 5.0,
            hs_threshold: 10.0,
        }
    }
}

impl SelectionPolicy {
    /// The assay and concentration to report, if any was measured.
    pub fn select(&self, hs: Option<f64>, br: Option<f64>) -> Option<(Assay, f64)> {
        match (hs, br) {
            (Some(hs), None) => Some((Assay::HighSensitivity, hs)),
            (None, Some(br)) => Some((Assay::BroadRange, br)),
            (Some(hs), Some(br)) => {
                if br > self.br_threshold || hs > self.hs_threshold {
                    Some((Assay::BroadRange, br))
                } else {
                    Some((Assay::HighSensitivity, hs))
                }
            }
            (None, None) => None,
        }
    }
}

/// A sample's HS and BR results and the reported concentration.
#[derive(Debug, Clone, PartialEq)]
pub struct QubitSample {
    pub sample: String,
    pub hs_rfu: Option<f64>,
    pub hs_concentration: Option<f64>,
    pub br_rfu: Option<f64>,
    pub br_concentration: Option<f64>,
    pub chosen: Option<Assay>,
    pub concentration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QubitResult {
    pub hs_curve: Option<AssayCurve>,
    pub br_curve: Option<AssayCurve>,
    /// Samples in natural order of their ids.
    pub samples: Vec<QubitSample>,
}

/// Compare strings treating runs of digits as numbers, so `2 < 14`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let mut na = String::new();
                while let Some(c) = a.peek().copied().filter(|c| c.is_ascii_digit()) {
                    na.push(c);
                    a.next();
                }
                let mut nb = String::new();
                while let Some(c) = b.peek().copied().filter(|c| c.is_ascii_digit()) {
                    nb.push(c);
                    b.next();
                }
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

/// Fit each assay present on the plate and quantify its samples.
pub fn quantify_qubit(
    readings: &[QubitReading],
    policy: &SelectionPolicy,
) -> Result<QubitResult, CfxError> {
    let mut standards: IndexMap<Assay, Vec<(f64, f64)>> = IndexMap::new();
    let mut measured: IndexMap<&str, [Option<f64>; 2]> = IndexMap::new();
    for reading in readings {
        match classify(&reading.sample)? {
            QubitLabel::Standard { assay, ng_per_ul } => {
                standards.entry(assay).or_default().push((ng_per_ul, reading.rfu));
            }
            QubitLabel::Sample { assay, id } => {
                let slot = match assay {
                    Assay::HighSensitivity => 0,
                    Assay::BroadRange => 1,
                };
                let entry = measured.entry(id).or_default();
                if entry[slot].is_some() {
                    warn!(sample = id, assay = %assay, "duplicate reading, keeping the last");
                }
                entry[slot] = Some(reading.rfu);
            }
            QubitLabel::Other => {}
        }
    }

    let hs_curve = standards
        .swap_remove(&Assay::HighSensitivity)
        .map(|s| fit_assay(Assay::HighSensitivity, s))
        .transpose()?;
    let br_curve = standards
        .swap_remove(&Assay::BroadRange)
        .map(|s| fit_assay(Assay::BroadRange, s))
        .transpose()?;
    for curve in [&hs_curve, &br_curve].into_iter().flatten() {
        info!(assay = %curve.assay, equation = %curve.equation(), "qubit standard curve");
    }

    let mut samples = Vec::with_capacity(measured.len());
    for (id, [hs_rfu, br_rfu]) in measured {
        let hs_concentration = concentration_for(&hs_curve, hs_rfu, Assay::HighSensitivity, id)?;
        let br_concentration = concentration_for(&br_curve, br_rfu, Assay::BroadRange, id)?;
        let chosen = policy.select(hs_concentration, br_concentration);
        samples.push(QubitSample {
            sample: id.to_string(),
            hs_rfu,
            hs_concentration,
            br_rfu,
            br_concentration,
            chosen: chosen.map(|c| c.0),
            concentration: chosen.map(|c| c.1),
        });
    }
    samples.sort_by(|a, b| natural_cmp(&a.sample, &b.sample));

    Ok(QubitResult {
        hs_curve,
        br_curve,
        samples,
    })
}

fn concentration_for(
    curve: &Option<AssayCurve>,
    rfu: Option<f64>,
    assay: Assay,
    sample: &str,
) -> Result<Option<f64>, CfxError> {
    match (curve, rfu) {
        (Some(curve), Some(rfu)) => Ok(Some(curve.concentration(rfu))),
        (None, Some(_)) => Err(CfxError::InsufficientStandards {
            plate: format!("{} standards (needed for sample '{}')", assay, sample),
            usable: 0,
        }),
        (_, None) => Ok(None),
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| format!("{:.4}", v))
}

impl QubitResult {
    /// Write the per-sample table as TSV.
    pub fn write_tsv<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CfxError> {
        writeln!(
            writer,
            "Sample\tHS_RFU\tHS_[DNA] ng/µL\tBR_RFU\tBR_[DNA] ng/µL\t[DNA] ng/µL\tAssay"
        )?;
        for s in self.samples.iter() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                s.sample,
                fmt_opt(s.hs_rfu),
                fmt_opt(s.hs_concentration),
                fmt_opt(s.br_rfu),
                fmt_opt(s.br_concentration),
                fmt_opt(s.concentration),
                s.chosen.map_or_else(String::new, |a| a.to_string())
            )?;
        }
        Ok(())
    }
}
