//! Standard curve fitting from the reference plate's dilution series.
//!
//! A dilution labelled `10^x` holds `std_curve_copies × 10^x` copies/µL.
//! Cq is regressed on log10(copies); the inverse of that line turns any
//! corrected Cq back into a copy number.
//!
use ndarray::Array1;
use tracing::{info, warn};

use crate::error::CfxError;
use crate::normalize::CorrectedPlate;
use crate::numeric::{linear_regression, LinearFit};
use crate::plate::SampleKind;

/// What to do with a fitted slope that is not negative.
///
/// Cq must fall as template concentration rises, so a slope of zero or
/// above points to a failed or mislabelled dilution series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlopePolicy {
    /// Abort with [`CfxError::DegenerateCalibration`].
    #[default]
    Reject,
    /// Keep the curve and log a warning.
    Warn,
}

/// Settings for building a standard curve.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveSettings {
    /// Copies/µL of the standard at exponent 0.
    pub std_curve_copies: f64,
    /// Exponents left out of the regression but kept in the point table.
    pub exponents_to_skip: Vec<f64>,
    pub slope_policy: SlopePolicy,
}

impl CurveSettings {
    fn skips(&self, exponent: f64) -> bool {
        self.exponents_to_skip
            .iter()
            .any(|&skip| (skip - exponent).abs() < 1e-9)
    }
}

/// One dilution well of the standard series.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardPoint {
    pub sample: String,
    pub exponent: f64,
    pub copies: f64,
    pub log_copies: f64,
    pub cq: Option<f64>,
    pub corrected_cq: Option<f64>,
    /// Left out of the regression by configuration.
    pub excluded: bool,
}

impl StandardPoint {
    /// Whether this point entered the regression.
    pub fn in_fit(&self) -> bool {
        !self.excluded && self.corrected_cq.is_some()
    }
}

/// The fitted line `Cq = intercept + slope × log10(copies)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationModel {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    /// Amplification efficiency in percent, `(10^(-1/slope) - 1) × 100`.
    pub efficiency: f64,
    pub n_points: usize,
}

impl CalibrationModel {
    /// Build a model from a line fit, rejecting a zero, near-zero or
    /// non-finite slope.
    pub fn from_fit(fit: LinearFit) -> Result<Self, CfxError> {
        if fit.slope == 0.0 || !fit.slope.is_finite() || !fit.intercept.is_finite() {
            return Err(CfxError::DegenerateCalibration(format!(
                "slope {} cannot be inverted",
                fit.slope
            )));
        }
        let efficiency = (10f64.powf(-1.0 / fit.slope) - 1.0) * 100.0;
        // a slope this close to zero makes every inverse estimate overflow
        if !efficiency.is_finite() {
            return Err(CfxError::DegenerateCalibration(format!(
                "slope {:e} is too close to zero to be inverted",
                fit.slope
            )));
        }
        Ok(Self {
            slope: fit.slope,
            intercept: fit.intercept,
            r_squared: fit.r_squared,
            efficiency,
            n_points: fit.n,
        })
    }

    /// A slope of zero or above; Cq would rise with concentration.
    pub fn is_inverted(&self) -> bool {
        self.slope >= 0.0
    }

    /// The Cq the line predicts for `log_copies`.
    pub fn predict_cq(&self, log_copies: f64) -> f64 {
        self.intercept + self.slope * log_copies
    }

    /// log10(copies/µL) for a corrected Cq.
    pub fn log_copies(&self, corrected_cq: f64) -> f64 {
        (corrected_cq - self.intercept) / self.slope
    }

    /// Copies/µL for a corrected Cq.
    pub fn copies(&self, corrected_cq: f64) -> f64 {
        10f64.powf(self.log_copies(corrected_cq))
    }

    /// The curve as `y = <slope>X + <intercept>`.
    pub fn equation(&self) -> String {
        format!("y = {:.3}X + {:.2}", self.slope, self.intercept)
    }
}

/// The dilution series of the reference plate with its fitted model.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardCurve {
    pub plate: String,
    pub points: Vec<StandardPoint>,
    pub model: CalibrationModel,
}

impl StandardCurve {
    /// Points that entered the regression.
    pub fn included(&self) -> impl Iterator<Item = &StandardPoint> {
        self.points.iter().filter(|p| p.in_fit())
    }

    /// Points skipped by configuration.
    pub fn excluded(&self) -> impl Iterator<Item = &StandardPoint> {
        self.points.iter().filter(|p| p.excluded)
    }

    /// The highest exponent that entered the regression.
    pub fn max_exponent(&self) -> Option<f64> {
        self.included().map(|p| p.exponent).reduce(f64::max)
    }
}

/// Fit the standard curve from the dilution wells of the (corrected)
/// reference plate.
///
/// Wells whose exponent is skipped, and wells that did not amplify, stay in
/// the returned point table but are left out of the fit.
pub fn build_standard_curve(
    reference: &CorrectedPlate,
    settings: &CurveSettings,
) -> Result<StandardCurve, CfxError> {
    if !(settings.std_curve_copies > 0.0 && settings.std_curve_copies.is_finite()) {
        return Err(CfxError::InvalidConfig(format!(
            "std_curve_copies must be positive, got {}",
            settings.std_curve_copies
        )));
    }

    let points: Vec<StandardPoint> = reference
        .rows
        .iter()
        .filter_map(|row| match row.kind {
            SampleKind::Dilution { exponent } => {
                let copies = settings.std_curve_copies * 10f64.powf(exponent);
                Some(StandardPoint {
                    sample: row.sample.clone(),
                    exponent,
                    copies,
                    log_copies: copies.log10(),
                    cq: row.cq,
                    corrected_cq: row.corrected_cq,
                    excluded: settings.skips(exponent),
                })
            }
            _ => None,
        })
        .collect();

    let (x, y): (Vec<f64>, Vec<f64>) = points
        .iter()
        .filter_map(|p| match (p.in_fit(), p.corrected_cq) {
            (true, Some(cq)) => Some((p.log_copies, cq)),
            _ => None,
        })
        .unzip();
    if x.len() < 2 {
        return Err(CfxError::InsufficientStandards {
            plate: reference.id.clone(),
            usable: x.len(),
        });
    }

    let fit = linear_regression(&Array1::from_vec(x), &Array1::from_vec(y)).ok_or_else(|| {
        CfxError::DegenerateCalibration(format!(
            "all usable standards on '{}' share one concentration",
            reference.id
        ))
    })?;
    let model = CalibrationModel::from_fit(fit)?;

    if model.is_inverted() {
        match settings.slope_policy {
            SlopePolicy::Reject => {
                return Err(CfxError::DegenerateCalibration(format!(
                    "slope {:.3} on '{}' is not negative; the dilution series is inverted or failed",
                    model.slope, reference.id
                )))
            }
            SlopePolicy::Warn => warn!(
                plate = %reference.id,
                slope = model.slope,
                "standard curve slope is not negative"
            ),
        }
    }

    info!(
        plate = %reference.id,
        slope = model.slope,
        intercept = model.intercept,
        r_squared = model.r_squared,
        efficiency = model.efficiency,
        points = model.n_points,
        "standard curve fitted"
    );

    Ok(StandardCurve {
        plate: reference.id.clone(),
        points,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::CorrectedMeasurement;
    use crate::numeric::assert_float_eq;

    const STD_COPIES: f64 = 4.06;

    fn dilution(exponent: f64, cq: Option<f64>) -> CorrectedMeasurement {
        CorrectedMeasurement {
            sample: format!("10^{}", exponent),
            kind: SampleKind::Dilution { exponent },
            cq,
            corrected_cq: cq,
        }
    }

    /// Cq = 35 - 3.3 × exponent, plus an optional offset at one exponent.
    fn reference_plate(offset_at: Option<(f64, f64)>) -> CorrectedPlate {
        let mut rows: Vec<CorrectedMeasurement> = (0..5)
            .map(|e| {
                let e = e as f64;
                let mut cq = 35.0 - 3.3 * e;
                if let Some((at, offset)) = offset_at {
                    if at == e {
                        cq += offset;
                    }
                }
                dilution(e, Some(cq))
            })
            .collect();
        rows.push(CorrectedMeasurement {
            sample: "STD".to_string(),
            kind: SampleKind::Reference,
            cq: Some(20.0),
            corrected_cq: Some(20.0),
        });
        CorrectedPlate {
            id: "PCR_1".to_string(),
            correction: 0.0,
            rows,
        }
    }

    fn settings(skip: Vec<f64>) -> CurveSettings {
        CurveSettings {
            std_curve_copies: STD_COPIES,
            exponents_to_skip: skip,
            slope_policy: SlopePolicy::Reject,
        }
    }

    #[test]
    fn test_fit_exact_series() {
        let curve = build_standard_curve(&reference_plate(None), &settings(vec![])).unwrap();
        let model = curve.model;
        assert_eq!(curve.points.len(), 5);
        assert_float_eq(model.slope, -3.3, 1e-9);
        assert_float_eq(model.intercept, 35.0 + 3.3 * STD_COPIES.log10(), 1e-9);
        assert_float_eq(model.r_squared, 1.0, 1e-9);
        let expected_eff = (10f64.powf(1.0 / 3.3) - 1.0) * 100.0;
        assert_float_eq(model.efficiency, expected_eff, 1e-9);
        assert_eq!(curve.max_exponent(), Some(4.0));
        assert_eq!(model.equation(), "y = -3.300X + 37.01");
    }

    #[test]
    fn test_inversion_recovers_log_copies() {
        let curve = build_standard_curve(&reference_plate(None), &settings(vec![])).unwrap();
        for point in curve.included() {
            let fitted_cq = curve.model.predict_cq(point.log_copies);
            assert_float_eq(curve.model.log_copies(fitted_cq), point.log_copies, 1e-9);
            assert_float_eq(
                curve.model.copies(point.corrected_cq.unwrap()),
                point.copies,
                point.copies * 1e-9,
            );
        }
    }

    #[test]
    fn test_excluded_exponent_does_not_affect_fit() {
        // an outlier at exponent 0 would bend the line if it were used
        let plate = reference_plate(Some((0.0, 4.0)));
        let curve = build_standard_curve(&plate, &settings(vec![0.0])).unwrap();
        assert_float_eq(curve.model.slope, -3.3, 1e-9);
        assert_eq!(curve.model.n_points, 4);

        let excluded: Vec<&StandardPoint> = curve.excluded().collect();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].exponent, 0.0);
        assert_float_eq(excluded[0].copies, STD_COPIES, 1e-12);
        assert_float_eq(excluded[0].log_copies, STD_COPIES.log10(), 1e-12);
        assert_eq!(curve.points.len(), 5);

        let unskipped = build_standard_curve(&plate, &settings(vec![])).unwrap();
        assert!((unskipped.model.slope + 3.3).abs() > 1e-3);
    }

    #[test]
    fn test_missing_cq_is_not_fitted() {
        let mut plate = reference_plate(None);
        plate.rows[2] = dilution(2.0, None);
        let curve = build_standard_curve(&plate, &settings(vec![])).unwrap();
        assert_eq!(curve.model.n_points, 4);
        assert_eq!(curve.points.len(), 5);
        assert!(!curve.points[2].in_fit());
    }

    #[test]
    fn test_insufficient_standards() {
        let plate = reference_plate(None);
        let err = build_standard_curve(&plate, &settings(vec![0.0, 1.0, 2.0, 3.0])).unwrap_err();
        assert!(matches!(
            err,
            CfxError::InsufficientStandards { ref plate, usable: 1 } if plate == "PCR_1"
        ));
    }

    #[test]
    fn test_flat_curve_is_degenerate() {
        let mut plate = reference_plate(None);
        for row in plate.rows.iter_mut() {
            row.cq = Some(30.0);
            row.corrected_cq = Some(30.0);
        }
        let err = build_standard_curve(&plate, &settings(vec![])).unwrap_err();
        assert!(matches!(err, CfxError::DegenerateCalibration(_)));
    }

    #[test]
    fn test_near_zero_slope_is_degenerate() {
        let rows = vec![
            dilution(0.0, Some(30.0)),
            dilution(1.0, Some(30.0 - 1e-12)),
        ];
        let plate = CorrectedPlate {
            id: "PCR_1".to_string(),
            correction: 0.0,
            rows,
        };
        let err = build_standard_curve(&plate, &settings(vec![])).unwrap_err();
        assert!(matches!(err, CfxError::DegenerateCalibration(_)));

        let mut lenient = settings(vec![]);
        lenient.slope_policy = SlopePolicy::Warn;
        let err = build_standard_curve(&plate, &lenient).unwrap_err();
        assert!(matches!(err, CfxError::DegenerateCalibration(_)));
    }

    #[test]
    fn test_single_concentration_is_degenerate() {
        let rows = vec![dilution(2.0, Some(28.0)), dilution(2.0, Some(28.2))];
        let plate = CorrectedPlate {
            id: "PCR_1".to_string(),
            correction: 0.0,
            rows,
        };
        let err = build_standard_curve(&plate, &settings(vec![])).unwrap_err();
        assert!(matches!(err, CfxError::DegenerateCalibration(_)));
    }

    #[test]
    fn test_inverted_slope_policy() {
        let rows: Vec<CorrectedMeasurement> = (0..3)
            .map(|e| dilution(e as f64, Some(20.0 + 3.3 * e as f64)))
            .collect();
        let plate = CorrectedPlate {
            id: "PCR_1".to_string(),
            correction: 0.0,
            rows,
        };
        let err = build_standard_curve(&plate, &settings(vec![])).unwrap_err();
        assert!(matches!(err, CfxError::DegenerateCalibration(_)));

        let mut lenient = settings(vec![]);
        lenient.slope_policy = SlopePolicy::Warn;
        let curve = build_standard_curve(&plate, &lenient).unwrap();
        assert!(curve.model.is_inverted());
    }
}
