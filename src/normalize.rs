//! Inter-plate normalization against the shared reference mix.
//!
//! Every plate carries replicates of the same reference mix (`STD`). The
//! difference between a plate's mean reference Cq and the reference plate's
//! mean is that plate's drift, and is subtracted from every well on it.
//!
use indexmap::IndexMap;
use tracing::info;

use crate::error::CfxError;
use crate::numeric::mean;
use crate::plate::{PlateSet, SampleKind};

/// A well with both its raw and drift-corrected Cq.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedMeasurement {
    pub sample: String,
    pub kind: SampleKind,
    pub cq: Option<f64>,
    pub corrected_cq: Option<f64>,
}

/// The reference-mix summary and drift of one plate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateCorrection {
    pub plate: String,
    /// Reference-mix Cq values on this plate, in export order.
    pub reference_cqs: Vec<f64>,
    pub reference_mean: f64,
    /// `reference_mean - reference plate's reference_mean`; zero for the
    /// reference plate itself.
    pub correction: f64,
}

/// One plate after correction.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedPlate {
    pub id: String,
    pub correction: f64,
    pub rows: Vec<CorrectedMeasurement>,
}

/// All plates of a run on the reference plate's Cq scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub reference_plate: String,
    pub reference_mean: f64,
    pub corrections: IndexMap<String, PlateCorrection>,
    pub plates: IndexMap<String, CorrectedPlate>,
}

impl Normalized {
    /// The correction applied to `plate`, if it was loaded.
    pub fn correction(&self, plate: &str) -> Option<f64> {
        self.corrections.get(plate).map(|c| c.correction)
    }

    /// The corrected reference plate.
    pub fn reference(&self) -> Option<&CorrectedPlate> {
        self.plates.get(&self.reference_plate)
    }
}

/// Compute one additive correction per plate and apply it to every well.
///
/// Fails if the reference plate was not loaded or has no amplified
/// reference-mix wells, or if any other plate has none: such a plate
/// cannot be put on the common scale.
pub fn normalize(plates: &PlateSet, reference_plate: &str) -> Result<Normalized, CfxError> {
    let reference = plates
        .get(reference_plate)
        .ok_or_else(|| CfxError::MissingReferencePlate(reference_plate.to_string()))?;
    let reference_mean = mean(&reference.reference_cqs())
        .ok_or_else(|| CfxError::MissingReferenceData(reference_plate.to_string()))?;

    let mut corrections = IndexMap::new();
    let mut corrected = IndexMap::new();
    for (id, plate) in plates.iter() {
        let reference_cqs = plate.reference_cqs();
        let plate_mean =
            mean(&reference_cqs).ok_or_else(|| CfxError::MissingPlateReference(id.clone()))?;
        let correction = if id == reference_plate {
            0.0
        } else {
            plate_mean - reference_mean
        };
        info!(plate = %id, reference_mean = plate_mean, correction, "plate correction");

        let rows = plate
            .measurements
            .iter()
            .map(|m| CorrectedMeasurement {
                sample: m.sample.clone(),
                kind: m.kind,
                cq: m.cq,
                corrected_cq: m.cq.map(|cq| cq - correction),
            })
            .collect();
        corrections.insert(
            id.clone(),
            PlateCorrection {
                plate: id.clone(),
                reference_cqs,
                reference_mean: plate_mean,
                correction,
            },
        );
        corrected.insert(
            id.clone(),
            CorrectedPlate {
                id: id.clone(),
                correction,
                rows,
            },
        );
    }

    Ok(Normalized {
        reference_plate: reference_plate.to_string(),
        reference_mean,
        corrections,
        plates: corrected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::assert_float_eq;
    use crate::plate::{LabelScheme, Plate};

    fn plate(id: &str, rows: &[(&str, Option<f64>)]) -> Plate {
        let scheme = LabelScheme::default();
        let mut p = Plate::new(id);
        for (sample, cq) in rows {
            p.push(sample, *cq, &scheme).unwrap();
        }
        p
    }

    fn two_plates() -> PlateSet {
        let mut plates = PlateSet::new();
        plates.insert(plate(
            "PCR_1",
            &[
                ("STD", Some(20.0)),
                ("STD", Some(20.2)),
                ("STD", Some(19.8)),
                ("S1", Some(25.0)),
            ],
        ));
        plates.insert(plate(
            "PCR_2",
            &[
                ("STD", Some(21.0)),
                ("STD", Some(21.0)),
                ("S1", Some(26.5)),
                ("S2", None),
            ],
        ));
        plates
    }

    #[test]
    fn test_reference_correction_is_zero() {
        let norm = normalize(&two_plates(), "PCR_1").unwrap();
        assert_eq!(norm.correction("PCR_1"), Some(0.0));
        assert_float_eq(norm.reference_mean, 20.0, 1e-12);
    }

    #[test]
    fn test_second_plate_correction_applies_to_all_rows() {
        let norm = normalize(&two_plates(), "PCR_1").unwrap();
        assert_float_eq(norm.correction("PCR_2").unwrap(), 1.0, 1e-12);
        let p2 = &norm.plates["PCR_2"];
        let s1 = p2.rows.iter().find(|r| r.sample == "S1").unwrap();
        assert_eq!(s1.cq, Some(26.5));
        assert_float_eq(s1.corrected_cq.unwrap(), 25.5, 1e-12);
        let s2 = p2.rows.iter().find(|r| r.sample == "S2").unwrap();
        assert_eq!(s2.corrected_cq, None);
    }

    #[test]
    fn test_corrected_reference_means_agree() {
        let norm = normalize(&two_plates(), "PCR_1").unwrap();
        let ref_means: Vec<f64> = norm
            .plates
            .values()
            .map(|p| {
                let cqs: Vec<f64> = p
                    .rows
                    .iter()
                    .filter(|r| r.kind == SampleKind::Reference)
                    .filter_map(|r| r.corrected_cq)
                    .collect();
                mean(&cqs).unwrap()
            })
            .collect();
        for m in ref_means {
            assert_float_eq(m, norm.reference_mean, 1e-9);
        }
    }

    #[test]
    fn test_reference_plate_without_std_fails() {
        let mut plates = PlateSet::new();
        plates.insert(plate("PCR_1", &[("S1", Some(25.0)), ("STD", None)]));
        let err = normalize(&plates, "PCR_1").unwrap_err();
        assert!(matches!(err, CfxError::MissingReferenceData(ref p) if p == "PCR_1"));
    }

    #[test]
    fn test_other_plate_without_std_is_reported_by_id() {
        let mut plates = two_plates();
        plates.insert(plate("PCR_3", &[("S1", Some(24.0))]));
        let err = normalize(&plates, "PCR_1").unwrap_err();
        assert!(matches!(err, CfxError::MissingPlateReference(ref p) if p == "PCR_3"));
        assert!(err.to_string().contains("PCR_3"));
    }

    #[test]
    fn test_unknown_reference_plate() {
        let err = normalize(&two_plates(), "PCR_9").unwrap_err();
        assert!(matches!(err, CfxError::MissingReferencePlate(_)));
    }
}
