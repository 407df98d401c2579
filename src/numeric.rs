use ndarray::Array1;
use num_traits::Float;
use std::fmt::Display;

/// Assert two floats are the same up to `eps`.
#[allow(dead_code)]
pub fn assert_float_eq<T>(left: T, right: T, eps: T)
where
    T: Float + Display,
{
    if left.is_nan() {
        assert!(right.is_nan(), "left is NaN, but right is not");
    } else {
        let diff = (left - right).abs();
        assert!(
            diff < eps,
            "values |{} - {}| ≥ {} (diff: {})",
            left,
            right,
            eps,
            diff
        );
    }
}

/// Assert two float slices are element-wise the same up to `eps`.
#[allow(dead_code)]
pub fn assert_floats_eq<T>(left: &[T], right: &[T], eps: T)
where
    T: Float + Display,
{
    assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(right.iter()) {
        assert_float_eq(*l, *r, eps)
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean<T: Float>(values: &[T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let n = T::from(values.len())?;
    let sum = values.iter().fold(T::zero(), |acc, &x| acc + x);
    Some(sum / n)
}

/// Sample standard deviation (n - 1 denominator). Undefined below two values.
pub fn sample_std_dev<T: Float>(values: &[T]) -> Option<T> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss = values
        .iter()
        .fold(T::zero(), |acc, &x| acc + (x - m) * (x - m));
    let dof = T::from(values.len() - 1)?;
    Some((ss / dof).sqrt())
}

/// Coefficient of variation in percent, `sd / mean × 100`, using the sample
/// standard deviation. Undefined below two values or when the mean is zero.
pub fn cv_percent<T: Float>(values: &[T]) -> Option<T> {
    let sd = sample_std_dev(values)?;
    let m = mean(values)?;
    if m == T::zero() {
        return None;
    }
    Some(sd / m * T::from(100.0)?)
}

/// Mean, spread and CV of one set of replicate values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReplicateStats {
    /// Number of values the statistics were computed over.
    pub n: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub cv_percent: Option<f64>,
}

impl ReplicateStats {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            n: values.len(),
            mean: mean(values),
            std_dev: sample_std_dev(values),
            cv_percent: cv_percent(values),
        }
    }
}

/// An ordinary least squares fit of `y ≈ intercept + slope × x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
    /// Number of points in the fit.
    pub n: usize,
}

impl LinearFit {
    /// The fitted `y` at `x`.
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit `y ≈ intercept + slope × x` by ordinary least squares.
///
/// Returns `None` if there are fewer than two points, the lengths differ,
/// or all `x` are identical (the fit is then singular).
pub fn linear_regression(x: &Array1<f64>, y: &Array1<f64>) -> Option<LinearFit> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }
    let x_mean = x.mean()?;
    let y_mean = y.mean()?;
    let dx = x - x_mean;
    let dy = y - y_mean;
    let sxx = dx.dot(&dx);
    let syy = dy.dot(&dy);
    let sxy = dx.dot(&dy);
    if sxx == 0.0 || !sxx.is_finite() {
        return None;
    }
    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let r_squared = if syy == 0.0 {
        0.0
    } else {
        (sxy * sxy) / (sxx * syy)
    };
    Some(LinearFit {
        slope,
        intercept,
        r_squared,
        n,
    })
}

/// Format a float in scientific notation with exponent sign and at least two
/// exponent digits, e.g. `4.06e+04`.
pub fn format_scientific(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let formatted = format!("{:.1$e}", value, decimals);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mean_and_sd() {
        let v = [25.0, 25.5];
        assert_float_eq(mean(&v).unwrap(), 25.25, 1e-12);
        assert_float_eq(sample_std_dev(&v).unwrap(), 0.5 / 2f64.sqrt(), 1e-12);
    }

    #[test]
    fn test_single_value_has_no_spread() {
        let stats = ReplicateStats::from_values(&[31.2]);
        assert_eq!(stats.n, 1);
        assert_eq!(stats.mean, Some(31.2));
        assert_eq!(stats.std_dev, None);
        assert_eq!(stats.cv_percent, None);
    }

    #[test]
    fn test_empty_stats() {
        let stats = ReplicateStats::from_values(&[]);
        assert_eq!(stats.mean, None);
        assert_eq!(stats.cv_percent, None);
    }

    #[test]
    fn test_cv_percent() {
        let v = [20.0, 20.2, 19.8];
        let cv = cv_percent(&v).unwrap();
        assert_float_eq(cv, 0.2 / 20.0 * 100.0, 1e-9);
    }

    #[test]
    fn test_linear_regression_exact_line() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![35.0, 31.7, 28.4, 25.1];
        let fit = linear_regression(&x, &y).unwrap();
        assert_float_eq(fit.slope, -3.3, 1e-9);
        assert_float_eq(fit.intercept, 35.0, 1e-9);
        assert_float_eq(fit.r_squared, 1.0, 1e-12);
        assert_eq!(fit.n, 4);
        assert_float_eq(fit.predict(1.5), 30.05, 1e-9);
    }

    #[test]
    fn test_linear_regression_singular() {
        let x = array![2.0, 2.0, 2.0];
        let y = array![1.0, 2.0, 3.0];
        assert!(linear_regression(&x, &y).is_none());
        assert!(linear_regression(&array![1.0], &array![1.0]).is_none());
    }

    #[test]
    fn test_format_scientific() {
        assert_eq!(format_scientific(40600.0, 2), "4.06e+04");
        assert_eq!(format_scientific(0.00123, 2), "1.23e-03");
        assert_eq!(format_scientific(1.0, 2), "1.00e+00");
        assert_eq!(format_scientific(1.5e123, 1), "1.5e+123");
    }
}
