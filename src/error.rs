use std::io;
use thiserror::Error;

use crate::file::FileError;

#[derive(Error, Debug)]
pub enum CfxError {
    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),
    #[error("File reading error: {0}")]
    FileError(#[from] FileError),
    #[error("Missing field '{0}'")]
    MissingField(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No plates found: {0}")]
    NoPlates(String),
    #[error("Plate '{plate}' is exported twice: {first} and {second}")]
    DuplicatePlate {
        plate: String,
        first: String,
        second: String,
    },
    #[error("Plate '{0}' was not loaded")]
    UnknownPlate(String),
    #[error("Reference plate '{0}' was not loaded")]
    MissingReferencePlate(String),
    #[error("Reference plate '{0}' has no reference-token rows with a Cq value")]
    MissingReferenceData(String),
    #[error("Plate '{0}' has no reference-token rows with a Cq value and cannot be normalized")]
    MissingPlateReference(String),
    #[error("Insufficient standards on '{plate}': {usable} usable dilution point(s), need at least 2")]
    InsufficientStandards { plate: String, usable: usize },
    #[error("Degenerate calibration: {0}")]
    DegenerateCalibration(String),
    #[error("Malformed dilution factor '{value}' for sample '{sample}'")]
    MalformedDilution { sample: String, value: String },
    #[error("Primer '{0}' not found in the primer table")]
    UnknownPrimer(String),
}
