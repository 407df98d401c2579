//! Per-sample quantification from corrected Cq replicates.
//!
//! Replicates of a sample are the wells that carry its label on any plate,
//! in plate load order and then well order. Each replicate's corrected Cq
//! is pushed through the inverse standard curve; the reported extract
//! concentration is the mean copy number times the sample's dilution factor.
//!
use indexmap::IndexMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

use crate::calibration::CalibrationModel;
use crate::error::CfxError;
use crate::file::InputFile;
use crate::normalize::Normalized;
use crate::numeric::{format_scientific, mean, ReplicateStats};
use crate::plate::{column_index, SampleKind};

/// Sample dilution factors, from a `Sample,Dilution` CSV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DilutionTable {
    pub factors: IndexMap<String, f64>,
}

impl DilutionTable {
    pub fn new() -> Self {
        Self {
            factors: IndexMap::new(),
        }
    }

    /// Set the dilution factor of `sample`, which must be positive and finite.
    pub fn insert(&mut self, sample: &str, factor: f64) -> Result<(), CfxError> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(CfxError::MalformedDilution {
                sample: sample.to_string(),
                value: factor.to_string(),
            });
        }
        self.factors.insert(sample.to_string(), factor);
        Ok(())
    }

    /// Read a dilution table. Every listed sample must carry a numeric,
    /// positive factor; a bad value is an error, never a silent default.
    pub fn from_csv<P: AsRef<Path>>(filepath: P) -> Result<DilutionTable, CfxError> {
        let input_file = InputFile::new(filepath.as_ref());
        let mut rdr = input_file.csv_reader(b',')?;
        let headers = rdr.headers()?.clone();
        let sample_idx = column_index(&headers, "Sample")?;
        let dilution_idx = column_index(&headers, "Dilution")?;

        let mut table = DilutionTable::new();
        for result in rdr.records() {
            let record = result?;
            let sample = record.get(sample_idx).unwrap_or("").trim();
            if sample.is_empty() {
                continue;
            }
            let value = record.get(dilution_idx).unwrap_or("").trim();
            let factor: f64 = value.parse().map_err(|_| CfxError::MalformedDilution {
                sample: sample.to_string(),
                value: value.to_string(),
            })?;
            table.insert(sample, factor).map_err(|_| CfxError::MalformedDilution {
                sample: sample.to_string(),
                value: value.to_string(),
            })?;
        }
        Ok(table)
    }

    /// The factor for `sample`, defaulting to undiluted when it is absent.
    pub fn lookup(&self, sample: &str) -> DilutionFactor {
        match self.factors.get(sample) {
            Some(&factor) => DilutionFactor {
                factor,
                source: DilutionSource::Table,
            },
            None => DilutionFactor::default(),
        }
    }
}

/// Where a sample's dilution factor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DilutionSource {
    Table,
    /// Not listed (or no table given); treated as undiluted.
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DilutionFactor {
    pub factor: f64,
    pub source: DilutionSource,
}

impl Default for DilutionFactor {
    fn default() -> Self {
        Self {
            factor: 1.0,
            source: DilutionSource::Default,
        }
    }
}

/// Non-fatal data problems attached to one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleIssue {
    /// No replicate amplified; there is no concentration.
    NoReplicateData,
    /// The sample is not in the dilution table; factor 1 was used.
    MissingDilutionEntry,
}

impl fmt::Display for SampleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleIssue::NoReplicateData => write!(f, "no replicate data"),
            SampleIssue::MissingDilutionEntry => write!(f, "default dilution used"),
        }
    }
}

/// The reported extract concentration of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Concentration {
    /// Copies/µL of extract.
    Copies(f64),
    NoData,
}

impl Concentration {
    pub fn value(&self) -> Option<f64> {
        match self {
            Concentration::Copies(c) => Some(*c),
            Concentration::NoData => None,
        }
    }
}

impl fmt::Display for Concentration {
    /// Scientific notation with two decimals, or `no data`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concentration::Copies(c) => write!(f, "{}", format_scientific(*c, 2)),
            Concentration::NoData => write!(f, "no data"),
        }
    }
}

/// A replicated sample with its derived quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleAggregate {
    pub sample: String,
    /// Plate of each replicate, aligned with `corrected_cqs`.
    pub plates: Vec<String>,
    /// Corrected Cq of each replicate; `None` where the well did not amplify.
    pub corrected_cqs: Vec<Option<f64>>,
    /// Copies/µL of each replicate.
    pub copies: Vec<Option<f64>>,
    pub cq_stats: ReplicateStats,
    pub copies_stats: ReplicateStats,
    pub dilution: DilutionFactor,
    pub concentration: Concentration,
    pub issues: Vec<SampleIssue>,
}

impl SampleAggregate {
    pub fn n_replicates(&self) -> usize {
        self.corrected_cqs.len()
    }

    pub fn has_issue(&self, issue: SampleIssue) -> bool {
        self.issues.contains(&issue)
    }
}

/// Group the ordinary samples of all corrected plates and quantify them
/// against `model`.
///
/// Samples without any amplified replicate get [`Concentration::NoData`]
/// and do not affect other samples. A replicate whose copy estimate is not
/// finite fails with [`CfxError::DegenerateCalibration`] naming the sample.
pub fn quantify(
    normalized: &Normalized,
    model: &CalibrationModel,
    dilutions: Option<&DilutionTable>,
) -> Result<Vec<SampleAggregate>, CfxError> {
    let mut groups: IndexMap<&str, Vec<(&str, Option<f64>)>> = IndexMap::new();
    for (plate_id, plate) in normalized.plates.iter() {
        for row in plate.rows.iter().filter(|r| r.kind == SampleKind::Sample) {
            groups
                .entry(row.sample.as_str())
                .or_default()
                .push((plate_id.as_str(), row.corrected_cq));
        }
    }

    groups
        .into_iter()
        .map(|(sample, replicates)| {
            let (plates, corrected_cqs): (Vec<String>, Vec<Option<f64>>) = replicates
                .into_iter()
                .map(|(plate, cq)| (plate.to_string(), cq))
                .unzip();
            aggregate(sample, plates, corrected_cqs, model, dilutions)
        })
        .collect()
}

fn aggregate(
    sample: &str,
    plates: Vec<String>,
    corrected_cqs: Vec<Option<f64>>,
    model: &CalibrationModel,
    dilutions: Option<&DilutionTable>,
) -> Result<SampleAggregate, CfxError> {
    let copies: Vec<Option<f64>> = corrected_cqs
        .iter()
        .map(|cq| cq.map(|cq| model.copies(cq)))
        .collect();
    if let Some((plate, _)) = plates
        .iter()
        .zip(copies.iter())
        .find(|(_, c)| c.map_or(false, |c| !c.is_finite()))
    {
        return Err(CfxError::DegenerateCalibration(format!(
            "sample '{}' on '{}' has a copy estimate that is not finite",
            sample, plate
        )));
    }
    let valid_cqs: Vec<f64> = corrected_cqs.iter().flatten().copied().collect();
    let valid_copies: Vec<f64> = copies.iter().flatten().copied().collect();

    let mut issues = Vec::new();
    let dilution = match dilutions {
        Some(table) => table.lookup(sample),
        None => DilutionFactor::default(),
    };
    if dilution.source == DilutionSource::Default {
        if dilutions.is_some() {
            warn!(sample, "sample not in dilution table, using factor 1");
        } else {
            debug!(sample, "no dilution table, using factor 1");
        }
        issues.push(SampleIssue::MissingDilutionEntry);
    }

    let concentration = match mean(&valid_copies) {
        Some(mean_copies) => Concentration::Copies(mean_copies * dilution.factor),
        None => {
            warn!(sample, replicates = corrected_cqs.len(), "no replicate amplified");
            issues.push(SampleIssue::NoReplicateData);
            Concentration::NoData
        }
    };

    Ok(SampleAggregate {
        sample: sample.to_string(),
        plates,
        cq_stats: ReplicateStats::from_values(&valid_cqs),
        copies_stats: ReplicateStats::from_values(&valid_copies),
        corrected_cqs,
        copies,
        dilution,
        concentration,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{build_standard_curve, CurveSettings, SlopePolicy};
    use crate::normalize::normalize;
    use crate::numeric::assert_float_eq;
    use crate::plate::{LabelScheme, Plate, PlateSet};

    fn model() -> CalibrationModel {
        CalibrationModel {
            slope: -3.3,
            intercept: 37.0,
            r_squared: 1.0,
            efficiency: 100.0,
            n_points: 5,
        }
    }

    fn normalized_fixture() -> Normalized {
        let plates = PlateSet::from_folder("tests/data", "TEST", &LabelScheme::default()).unwrap();
        normalize(&plates, "PCR_1").unwrap()
    }

    #[test]
    fn test_replicates_in_first_seen_plate_order() {
        let samples = quantify(&normalized_fixture(), &model(), None).unwrap();
        let names: Vec<&str> = samples.iter().map(|s| s.sample.as_str()).collect();
        assert_eq!(names, vec!["S1", "S2", "S3", "blank", "S4"]);

        let s1 = &samples[0];
        assert_eq!(s1.plates, vec!["PCR_1", "PCR_2", "PCR_10"]);
        let cqs: Vec<f64> = s1.corrected_cqs.iter().map(|c| c.unwrap()).collect();
        crate::numeric::assert_floats_eq(&cqs, &[25.0, 25.5, 25.1], 1e-9);
        assert_eq!(s1.cq_stats.n, 3);

        let s2 = &samples[1];
        assert_eq!(s2.n_replicates(), 3);
        assert_eq!(s2.corrected_cqs[2], None);
        assert_eq!(s2.cq_stats.n, 2);
    }

    #[test]
    fn test_ordering_does_not_depend_on_load_order() {
        let scheme = LabelScheme::default();
        let mut reversed = PlateSet::new();
        for (id, file) in [
            ("PCR_10", "tests/data/TEST_PCR_10.csv"),
            ("PCR_2", "tests/data/TEST_PCR_2.csv"),
            ("PCR_1", "tests/data/TEST_PCR_1.csv"),
        ] {
            reversed.insert(Plate::from_csv(id, file, &scheme).unwrap());
        }
        reversed.sort_by_plate_number();
        let norm = normalize(&reversed, "PCR_1").unwrap();

        let a = quantify(&normalized_fixture(), &model(), None).unwrap();
        let b = quantify(&norm, &model(), None).unwrap();
        assert_eq!(a, b);
        assert_eq!(b[0].plates, vec!["PCR_1", "PCR_2", "PCR_10"]);
    }

    #[test]
    fn test_non_finite_copies_fail() {
        let flat = CalibrationModel {
            slope: -1e-300,
            ..model()
        };
        let err = quantify(&normalized_fixture(), &flat, None).unwrap_err();
        assert!(matches!(err, CfxError::DegenerateCalibration(ref msg) if msg.contains("S1")));
    }

    #[test]
    fn test_copies_and_concentration() {
        let m = model();
        let samples = quantify(&normalized_fixture(), &m, None).unwrap();
        let s3 = samples.iter().find(|s| s.sample == "S3").unwrap();
        let expected = 10f64.powf((27.0 - 37.0) / -3.3);
        assert_float_eq(s3.copies[0].unwrap(), expected, expected * 1e-12);
        assert_eq!(s3.concentration, Concentration::Copies(expected));
        assert_eq!(s3.cq_stats.cv_percent, None);
        assert_eq!(s3.copies_stats.cv_percent, None);
    }

    #[test]
    fn test_all_missing_sample_has_no_data() {
        let samples = quantify(&normalized_fixture(), &model(), None).unwrap();
        let s4 = samples.iter().find(|s| s.sample == "S4").unwrap();
        assert_eq!(s4.concentration, Concentration::NoData);
        assert_eq!(s4.concentration.to_string(), "no data");
        assert!(s4.has_issue(SampleIssue::NoReplicateData));
        assert_eq!(s4.cq_stats.mean, None);
        // neighbours are unaffected
        let s1 = samples.iter().find(|s| s.sample == "S1").unwrap();
        assert!(s1.concentration.value().is_some());
    }

    #[test]
    fn test_dilution_factors_and_default() {
        let table = DilutionTable::from_csv("tests/data/TEST_dilution_rates.csv").unwrap();
        let m = model();
        let samples = quantify(&normalized_fixture(), &m, Some(&table)).unwrap();

        let s1 = samples.iter().find(|s| s.sample == "S1").unwrap();
        assert_eq!(s1.dilution.factor, 10.0);
        assert_eq!(s1.dilution.source, DilutionSource::Table);
        let mean_copies = mean(&s1.copies.iter().flatten().copied().collect::<Vec<_>>()).unwrap();
        assert_float_eq(
            s1.concentration.value().unwrap(),
            mean_copies * 10.0,
            mean_copies * 1e-9,
        );
        assert!(!s1.has_issue(SampleIssue::MissingDilutionEntry));

        let s3 = samples.iter().find(|s| s.sample == "S3").unwrap();
        assert_eq!(s3.dilution.factor, 1.0);
        assert!(s3.has_issue(SampleIssue::MissingDilutionEntry));
        assert_float_eq(
            s3.concentration.value().unwrap(),
            s3.copies[0].unwrap(),
            1e-9,
        );
    }

    #[test]
    fn test_malformed_dilution_fails() {
        let err = DilutionTable::from_csv("tests/data/bad_dilution_rates.csv").unwrap_err();
        assert!(matches!(
            err,
            CfxError::MalformedDilution { ref sample, ref value } if sample == "S1" && value == "ten"
        ));
        let mut table = DilutionTable::new();
        assert!(table.insert("S2", 0.0).is_err());
        assert!(table.insert("S2", -2.0).is_err());
    }

    #[test]
    fn test_scenario_two_plates() {
        let plates = PlateSet::from_folder("tests/data", "TEST", &LabelScheme::default()).unwrap();
        let norm = normalize(&plates, "PCR_1").unwrap();
        assert_float_eq(norm.correction("PCR_2").unwrap(), 1.0, 1e-9);
        let curve = build_standard_curve(
            norm.reference().unwrap(),
            &CurveSettings {
                std_curve_copies: 4.06,
                exponents_to_skip: vec![],
                slope_policy: SlopePolicy::Reject,
            },
        )
        .unwrap();
        let samples = quantify(&norm, &curve.model, None).unwrap();
        let s1 = &samples[0];
        let first_two: Vec<f64> = s1.corrected_cqs[..2].iter().map(|c| c.unwrap()).collect();
        crate::numeric::assert_floats_eq(&first_two, &[25.0, 25.5], 1e-9);
    }

    #[test]
    fn test_concentration_display() {
        assert_eq!(Concentration::Copies(40600.0).to_string(), "4.06e+04");
    }
}
