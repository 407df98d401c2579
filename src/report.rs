//! TSV output of a finished qPCR run.
//!
//! One table per concern, each written through [`OutputFile`]. Set
//! [`ReportWriter::compress`] to get gzipped tables.
//!
//! | file                          | content                                  |
//! |-------------------------------|------------------------------------------|
//! | `<run>_final_data.tsv`        | per-sample replicates, CVs, concentration |
//! | `<run>_standard_curve.tsv`    | dilution points and the fitted line       |
//! | `<run>_std_samples.tsv`       | reference-mix Cq and correction per plate |
//! | `<run>_cv.tsv`                | CV series with thresholds, for plotting   |
//! | `<run>_raw_<plate>.tsv`       | raw and corrected Cq of every well        |
//!
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::analysis::QpcrReport;
use crate::error::CfxError;
use crate::file::OutputFile;
use crate::quantify::DilutionSource;

const PRECISION: usize = 4;
const MISSING: &str = "NA";

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.1$}", v, PRECISION),
        _ => MISSING.to_string(),
    }
}

/// Write the per-sample table.
pub fn write_final_data<W: Write + ?Sized>(
    writer: &mut W,
    report: &QpcrReport,
) -> Result<(), CfxError> {
    let n = report.max_replicates();
    let mut header: Vec<String> = vec!["Sample".to_string()];
    header.extend((1..=n).map(|i| format!("Corrected_Cq_{}", i)));
    header.extend(
        [
            "Mean_Cq",
            "Stdev_Cq",
            "CV%_Cq",
            "CV%_copies",
            "Dilution",
            "Extract_copies/µL",
            "Exceeds_CV_Cq",
            "Exceeds_CV_copies",
            "Notes",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    writeln!(writer, "{}", header.join("\t"))?;

    for (sample, qc) in report.rows() {
        let mut fields: Vec<String> = vec![sample.sample.clone()];
        for i in 0..n {
            fields.push(match sample.corrected_cqs.get(i) {
                Some(cq) => fmt_opt(*cq),
                None => String::new(),
            });
        }
        fields.push(fmt_opt(sample.cq_stats.mean));
        fields.push(fmt_opt(sample.cq_stats.std_dev));
        fields.push(fmt_opt(qc.cv_cq));
        fields.push(fmt_opt(qc.cv_copies));
        fields.push(match sample.dilution.source {
            DilutionSource::Table => sample.dilution.factor.to_string(),
            DilutionSource::Default => format!("{} (default)", sample.dilution.factor),
        });
        fields.push(sample.concentration.to_string());
        fields.push(qc.flags.exceeds_cq_threshold.to_string());
        fields.push(qc.flags.exceeds_copies_threshold.to_string());
        fields.push(
            sample
                .issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        );
        writeln!(writer, "{}", fields.join("\t"))?;
    }
    Ok(())
}

/// Comment lines describing the fitted standard curve.
pub fn standard_curve_header(report: &QpcrReport) -> Vec<String> {
    let model = &report.curve.model;
    vec![
        format!("plate: {}", report.curve.plate),
        format!("equation: {}", model.equation()),
        format!("slope: {}", model.slope),
        format!("intercept: {}", model.intercept),
        format!("r_squared: {:.4}", model.r_squared),
        format!("efficiency: {:.0}%", model.efficiency),
        format!("points_in_fit: {}", model.n_points),
    ]
}

/// Write the dilution points; excluded rows stay in the table, flagged.
pub fn write_standard_curve<W: Write + ?Sized>(
    writer: &mut W,
    report: &QpcrReport,
) -> Result<(), CfxError> {
    writeln!(
        writer,
        "Sample\tPower\tcopies/µL\tlog_copies\tCq\tCorrected_Cq\tExcluded"
    )?;
    for point in report.curve.points.iter() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            point.sample,
            point.exponent,
            point.copies,
            fmt_opt(Some(point.log_copies)),
            fmt_opt(point.cq),
            fmt_opt(point.corrected_cq),
            point.excluded
        )?;
    }
    Ok(())
}

/// Write the reference-mix Cq values and correction of every plate.
pub fn write_std_samples<W: Write + ?Sized>(
    writer: &mut W,
    report: &QpcrReport,
) -> Result<(), CfxError> {
    let corrections = &report.normalized.corrections;
    let n = corrections
        .values()
        .map(|c| c.reference_cqs.len())
        .max()
        .unwrap_or(0);
    let mut header: Vec<String> = vec!["Plate".to_string()];
    header.extend((1..=n).map(|i| format!("Cq{}", i)));
    header.push("Mean".to_string());
    header.push("Correction".to_string());
    writeln!(writer, "{}", header.join("\t"))?;

    for correction in corrections.values() {
        let mut fields = vec![correction.plate.clone()];
        for i in 0..n {
            fields.push(
                correction
                    .reference_cqs
                    .get(i)
                    .map_or_else(String::new, |cq| fmt_opt(Some(*cq))),
            );
        }
        fields.push(fmt_opt(Some(correction.reference_mean)));
        fields.push(fmt_opt(Some(correction.correction)));
        writeln!(writer, "{}", fields.join("\t"))?;
    }
    Ok(())
}

/// Write the CV% series alongside the thresholds they are judged against.
pub fn write_cv_series<W: Write + ?Sized>(
    writer: &mut W,
    report: &QpcrReport,
) -> Result<(), CfxError> {
    let thresholds = &report.config.thresholds;
    writeln!(
        writer,
        "Sample\tCV%_Cq\tCV%_copies\tThreshold_Cq\tThreshold_copies"
    )?;
    for qc in report.qc.iter() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            qc.sample,
            fmt_opt(qc.cv_cq),
            fmt_opt(qc.cv_copies),
            thresholds.threshold_cq,
            thresholds.threshold_copies
        )?;
    }
    Ok(())
}

/// Write the raw and corrected Cq of every well on `plate`.
pub fn write_raw_plate<W: Write + ?Sized>(
    writer: &mut W,
    report: &QpcrReport,
    plate: &str,
) -> Result<(), CfxError> {
    let plate = report
        .normalized
        .plates
        .get(plate)
        .ok_or_else(|| CfxError::UnknownPlate(plate.to_string()))?;
    writeln!(writer, "Sample\tCq\tCorrected_Cq")?;
    for row in plate.rows.iter() {
        writeln!(
            writer,
            "{}\t{}\t{}",
            row.sample,
            fmt_opt(row.cq),
            fmt_opt(row.corrected_cq)
        )?;
    }
    Ok(())
}

/// Writes every report table of a run into one directory.
pub struct ReportWriter {
    pub out_dir: PathBuf,
    pub run_code: String,
    pub compress: bool,
}

impl ReportWriter {
    pub fn new<P: AsRef<Path>>(out_dir: P, run_code: &str) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            run_code: run_code.to_string(),
            compress: false,
        }
    }

    fn path(&self, table: &str) -> PathBuf {
        let ext = if self.compress { "tsv.gz" } else { "tsv" };
        self.out_dir
            .join(format!("{}_{}.{}", self.run_code, table, ext))
    }

    fn write_table<F>(
        &self,
        table: &str,
        header: Option<Vec<String>>,
        write: F,
    ) -> Result<PathBuf, CfxError>
    where
        F: FnOnce(&mut dyn Write) -> Result<(), CfxError>,
    {
        let path = self.path(table);
        let mut writer = OutputFile::new(&path, header).open()?;
        write(&mut writer)?;
        writer.finish()?;
        Ok(path)
    }

    /// Write all tables, creating the directory if needed, and return the
    /// paths written.
    pub fn write_all(&self, report: &QpcrReport) -> Result<Vec<PathBuf>, CfxError> {
        fs::create_dir_all(&self.out_dir)?;
        let mut written = vec![
            self.write_table("final_data", None, |w| write_final_data(w, report))?,
            self.write_table(
                "standard_curve",
                Some(standard_curve_header(report)),
                |w| write_standard_curve(w, report),
            )?,
            self.write_table("std_samples", None, |w| write_std_samples(w, report))?,
            self.write_table("cv", None, |w| write_cv_series(w, report))?,
        ];
        for plate in report.normalized.plates.keys() {
            written.push(self.write_table(&format!("raw_{}", plate), None, |w| {
                write_raw_plate(w, report, plate)
            })?);
        }
        info!(
            tables = written.len(),
            out_dir = %self.out_dir.display(),
            "report written"
        );
        Ok(written)
    }
}
