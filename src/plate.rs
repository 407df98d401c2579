//! Plate loading and sample-label classification.
//!
//! A CFX export is a CSV with (at least) a `Sample` and a `Cq` column. Each
//! file is one plate. Sample names follow a small convention:
//!
//! ```text
//! 10^0, 10^1, ...   dilution series of the standard (reference plate only)
//! STD               cross-plate reference mix, amplified on every plate
//! anything else     an unknown sample, possibly replicated across plates
//! ```
//!
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::CfxError;
use crate::file::InputFile;

/// The reserved sample-label forms.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelScheme {
    /// Prefix of dilution-series labels; the remainder is the power of ten.
    pub dilution_prefix: String,
    /// Exact label of the cross-plate reference mix.
    pub reference_token: String,
}

impl Default for LabelScheme {
    fn default() -> Self {
        Self {
            dilution_prefix: "10^".to_string(),
            reference_token: "STD".to_string(),
        }
    }
}

/// What a sample label denotes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleKind {
    /// A standard dilution at `std_curve_copies × 10^exponent` copies/µL.
    Dilution { exponent: f64 },
    /// The cross-plate reference mix.
    Reference,
    /// An unknown sample.
    Sample,
}

impl LabelScheme {
    /// Classify a sample label. A label carrying the dilution prefix but no
    /// numeric exponent is an error rather than an ordinary sample.
    pub fn classify(&self, label: &str) -> Result<SampleKind, CfxError> {
        if label == self.reference_token {
            return Ok(SampleKind::Reference);
        }
        match label.strip_prefix(&self.dilution_prefix) {
            Some(exponent_str) => {
                let exponent: f64 = exponent_str.trim().parse().map_err(|_| {
                    CfxError::ParseError(format!(
                        "dilution label '{}' has no numeric exponent",
                        label
                    ))
                })?;
                Ok(SampleKind::Dilution { exponent })
            }
            None => Ok(SampleKind::Sample),
        }
    }
}

/// One well as read from an instrument export.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub sample: String,
    pub kind: SampleKind,
    /// The cycle threshold; `None` when there was no amplification.
    pub cq: Option<f64>,
}

/// One PCR plate's measurements, in export order.
#[derive(Debug, Clone, PartialEq)]
pub struct Plate {
    pub id: String,
    pub measurements: Vec<Measurement>,
}

impl Plate {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            measurements: Vec::new(),
        }
    }

    /// Add a measurement, classifying its label with `scheme`.
    pub fn push(
        &mut self,
        sample: &str,
        cq: Option<f64>,
        scheme: &LabelScheme,
    ) -> Result<(), CfxError> {
        let kind = scheme.classify(sample)?;
        self.measurements.push(Measurement {
            sample: sample.to_string(),
            kind,
            cq,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Cq values of the reference-mix rows that amplified.
    pub fn reference_cqs(&self) -> Vec<f64> {
        self.measurements
            .iter()
            .filter(|m| m.kind == SampleKind::Reference)
            .filter_map(|m| m.cq)
            .collect()
    }

    /// Read a plate from a CFX CSV export (plain or gzipped).
    ///
    /// Only the `Sample` and `Cq` columns are used; rows with an empty sample
    /// name (unused wells) are skipped. Empty, `NaN` and `N/A` Cq cells are
    /// treated as no amplification.
    pub fn from_csv<P: AsRef<Path>>(
        id: &str,
        filepath: P,
        scheme: &LabelScheme,
    ) -> Result<Plate, CfxError> {
        let input_file = InputFile::new(filepath.as_ref());
        let mut rdr = input_file.csv_reader(b',')?;
        let headers = rdr.headers()?.clone();
        let sample_idx = column_index(&headers, "Sample")?;
        let cq_idx = column_index(&headers, "Cq")?;

        let mut plate = Plate::new(id);
        for result in rdr.records() {
            let record = result?;
            let sample = record.get(sample_idx).unwrap_or("").trim();
            if sample.is_empty() {
                continue;
            }
            let cq_str = record.get(cq_idx).unwrap_or("");
            let cq = parse_cq(cq_str).map_err(|_| {
                CfxError::ParseError(format!(
                    "plate '{}': cannot parse Cq '{}' for sample '{}'",
                    id, cq_str, sample
                ))
            })?;
            plate.push(sample, cq, scheme)?;
        }
        debug!(plate = id, rows = plate.len(), "plate loaded");
        Ok(plate)
    }
}

/// Find a named column, tolerating a UTF-8 BOM on the first header.
pub(crate) fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize, CfxError> {
    headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
        .ok_or_else(|| CfxError::MissingField(name.to_string()))
}

/// Parse a Cq cell; blanks and not-a-number markers are `None`.
pub fn parse_cq(value: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("n/a") {
        return Ok(None);
    }
    let cq: f64 = value.parse()?;
    Ok(if cq.is_nan() { None } else { Some(cq) })
}

/// The plates of one analytical run, keyed by plate id in load order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlateSet {
    pub plates: IndexMap<String, Plate>,
}

impl PlateSet {
    pub fn new() -> Self {
        Self {
            plates: IndexMap::new(),
        }
    }

    /// Add a plate; a plate with the same id is replaced in place.
    pub fn insert(&mut self, plate: Plate) {
        self.plates.insert(plate.id.clone(), plate);
    }

    pub fn get(&self, id: &str) -> Option<&Plate> {
        self.plates.get(id)
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Plate)> {
        self.plates.iter()
    }

    /// Order plates by ascending plate number (`PCR_2` before `PCR_10`),
    /// then by id. Replicate order downstream follows this order.
    pub fn sort_by_plate_number(&mut self) {
        self.plates
            .sort_by(|a, _, b, _| plate_sort_key(a).cmp(&plate_sort_key(b)));
    }

    /// Load every `<run_code>_*PCR_<n>.csv` export in `folder`.
    ///
    /// The plate id is `PCR_<n>`. Plates are ordered by ascending plate
    /// number so that replicate order does not depend on directory order.
    /// Two exports that resolve to the same plate id are an error.
    pub fn from_folder<P: AsRef<Path>>(
        folder: P,
        run_code: &str,
        scheme: &LabelScheme,
    ) -> Result<PlateSet, CfxError> {
        let folder = folder.as_ref();
        let mut found: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(folder)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(id) = plate_id_from_filename(name, run_code) {
                found.push((id, path));
            }
        }
        if found.is_empty() {
            return Err(CfxError::NoPlates(format!(
                "no '{}_*PCR_<n>.csv' files in {}",
                run_code,
                folder.display()
            )));
        }
        found.sort_by(|a, b| a.1.cmp(&b.1));

        let mut paths: IndexMap<String, PathBuf> = IndexMap::new();
        for (id, path) in found {
            if let Some(first) = paths.get(&id) {
                return Err(CfxError::DuplicatePlate {
                    plate: id,
                    first: first.display().to_string(),
                    second: path.display().to_string(),
                });
            }
            paths.insert(id, path);
        }

        let mut plates = PlateSet::new();
        for (id, path) in paths.iter() {
            plates.insert(Plate::from_csv(id, path, scheme)?);
        }
        plates.sort_by_plate_number();
        info!(plates = plates.len(), run = run_code, "loaded plates");
        Ok(plates)
    }
}

/// Extract `PCR_<n>` from an export file name such as
/// `NIOZ385_PCR_2.csv` or `NIOZ385_2024_PCR_2.csv.gz`.
pub fn plate_id_from_filename(name: &str, run_code: &str) -> Option<String> {
    let rest = name.strip_prefix(run_code)?.strip_prefix('_')?;
    if !rest.contains("PCR_") {
        return None;
    }
    let stem = rest
        .strip_suffix(".csv")
        .or_else(|| rest.strip_suffix(".csv.gz"))?;
    let number = stem.rsplit('_').next()?;
    if number.is_empty() {
        return None;
    }
    Some(format!("PCR_{}", number))
}

fn plate_sort_key(id: &str) -> (Option<u64>, String) {
    let number = id.rsplit('_').next().and_then(|n| n.parse().ok());
    (number, id.to_string())
}
