//! Density substitution catalog.
//!
//! Every derivative of the success probability with respect to one allocation
//! can be written as a probability computed under a reweighted return density
//! at that time-point. Each reweighting is `f(u) * scale * p(u)` for a
//! non-negative polynomial `p` in `u = r - mean`, so its CDF is a finite
//! combination of the normal CDF and gamma CDFs evaluated at `u^2 / (2 var)`.

use std::sync::LazyLock;

use statrs::distribution::{Continuous, ContinuousCDF, Gamma, Normal};
use statrs::function::gamma::gamma;

use super::error::{GlidePathError, GlideResult};
use super::returns::Moments;

/// Upper-tail mass of a substituted density below which its CDF is exactly one.
///
/// The polynomial weights fatten the tail well past where the normal term
/// vanishes; at the top of the ruin-factor axis the quartic density still
/// leaves about 1e-13 there.
const SATURATION_TOLERANCE: f64 = 1e-12;

/// Partial-moment gammas for orders 1 to 4: shape `(i + 1) / 2`, scale 1.
static PARTIAL_MOMENT_GAMMAS: LazyLock<[Gamma; 4]> = LazyLock::new(|| {
    [1.0, 1.5, 2.0, 2.5]
        .map(|shape| Gamma::new(shape, 1.0).expect("catalog gamma shapes are positive"))
});

/// Density used at one time-point.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DensityKind {
    Standard,
    Gradient,
    HessianQuadratic,
    HessianQuartic,
}

/// Which time-points use a substituted density in one engine call.
///
/// Slots: two gradient-density indices (one for a gradient component, both
/// for an off-diagonal Hessian term), then the quadratic and quartic Hessian
/// diagonal densities.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DensitySelector {
    slots: [Option<usize>; 4],
}

impl DensitySelector {
    pub fn standard() -> Self {
        Self::default()
    }

    pub fn gradient(timepoint: usize) -> Self {
        Self {
            slots: [Some(timepoint), None, None, None],
        }
    }

    pub fn gradient_pair(i: usize, j: usize) -> Self {
        Self {
            slots: [Some(i), Some(j), None, None],
        }
    }

    pub fn hessian_quadratic(timepoint: usize) -> Self {
        Self {
            slots: [None, None, Some(timepoint), None],
        }
    }

    pub fn hessian_quartic(timepoint: usize) -> Self {
        Self {
            slots: [None, None, None, Some(timepoint)],
        }
    }

    pub fn is_standard(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn validate(&self, horizon: usize) -> GlideResult<()> {
        for index in self.slots.iter().flatten() {
            if *index >= horizon {
                return Err(GlidePathError::SelectorOutOfRange {
                    index: *index,
                    horizon,
                });
            }
        }
        if let (Some(h1), Some(h2)) = (self.slots[2], self.slots[3]) {
            return Err(GlidePathError::ConflictingHessianDensities { h1, h2 });
        }
        let active: Vec<usize> = self.slots.iter().flatten().copied().collect();
        for (i, a) in active.iter().enumerate() {
            if active[i + 1..].contains(a) {
                return Err(GlidePathError::OverlappingSelector { timepoint: *a });
            }
        }
        Ok(())
    }

    pub fn kind_at(&self, timepoint: usize) -> DensityKind {
        let hit = |slot: Option<usize>| slot == Some(timepoint);
        if hit(self.slots[0]) || hit(self.slots[1]) {
            DensityKind::Gradient
        } else if hit(self.slots[2]) {
            DensityKind::HessianQuadratic
        } else if hit(self.slots[3]) {
            DensityKind::HessianQuartic
        } else {
            DensityKind::Standard
        }
    }
}

/// `(scale, coefficients)` with density `f(u) * scale * sum(c_i u^i)`.
pub(crate) fn polynomial(moments: &Moments, kind: DensityKind) -> (f64, Vec<f64>) {
    match kind {
        DensityKind::Standard => (1.0, vec![1.0]),
        DensityKind::Gradient => {
            let d = moments.score_shift();
            let scale = moments.score_curvature() / moments.gradient_scale();
            (scale, vec![d * d, 2.0 * d, 1.0])
        }
        DensityKind::HessianQuadratic => {
            let (_, b, c) = moments.second_score();
            let e = b / (2.0 * c);
            (1.0 / (moments.variance + e * e), vec![e * e, 2.0 * e, 1.0])
        }
        DensityKind::HessianQuartic => {
            let alpha = moments.score_curvature();
            let d = moments.score_shift();
            let k = moments.gradient_scale();
            let a2 = alpha * alpha;
            (
                1.0 / moments.score_second_moment(),
                vec![
                    a2 * d.powi(4) - 2.0 * k * alpha * d * d + k * k,
                    4.0 * a2 * d.powi(3) - 4.0 * k * alpha * d,
                    6.0 * a2 * d * d - 2.0 * k * alpha,
                    4.0 * a2 * d,
                    a2,
                ],
            )
        }
    }
}

/// Half the absolute central moment of order `i` of `N(0, variance)`.
fn half_absolute_moment(variance: f64, order: usize) -> f64 {
    let i = order as f64;
    (2.0 * variance).powf(i / 2.0) * gamma((i + 1.0) / 2.0) / (2.0 * std::f64::consts::PI.sqrt())
}

/// Coefficients for [`cdf`]: `[scale]` for the standard density, otherwise
/// `[scale, c_1 K_1, .., c_n K_n, c_0]`.
pub fn constants(moments: &Moments, selector: &DensitySelector, timepoint: usize) -> Vec<f64> {
    let kind = selector.kind_at(timepoint);
    let (scale, coefficients) = polynomial(moments, kind);
    if kind == DensityKind::Standard {
        return vec![scale];
    }
    let mut out = Vec::with_capacity(coefficients.len() + 1);
    out.push(scale);
    for (order, c) in coefficients.iter().enumerate().skip(1) {
        out.push(c * half_absolute_moment(moments.variance, order));
    }
    out.push(coefficients[0]);
    out
}

/// Gamma variables for the partial moments of order `1..=n`.
pub fn auxiliary_variables(selector: &DensitySelector, timepoint: usize) -> &'static [Gamma] {
    let orders = match selector.kind_at(timepoint) {
        DensityKind::Standard => 0,
        DensityKind::Gradient | DensityKind::HessianQuadratic => 2,
        DensityKind::HessianQuartic => 4,
    };
    &PARTIAL_MOMENT_GAMMAS[..orders]
}

/// CDF at `x` of whichever density `constants` encodes.
///
/// Above the mean the upper tail is summed term by term as well; once it is
/// below [`SATURATION_TOLERANCE`] the result is exactly 1.0.
pub fn cdf(moments: &Moments, constants: &[f64], normal: &Normal, gammas: &[Gamma], x: f64) -> f64 {
    let phi = normal.cdf(x);
    if constants.len() == 1 {
        return (constants[0] * phi).clamp(0.0, 1.0);
    }

    let u = x - moments.mean;
    let z2 = u * u / (2.0 * moments.variance);
    let last = constants[constants.len() - 1];
    let mut total = last * phi;
    let mut tail = last * normal.sf(x);
    for (idx, gamma_var) in gammas.iter().enumerate() {
        let order = idx + 1;
        let g = gamma_var.cdf(z2);
        let partial = if order % 2 == 0 {
            1.0 + u.signum() * g
        } else {
            -(1.0 - g)
        };
        total += constants[order] * partial;
        tail += constants[order] * gamma_var.sf(z2);
    }
    if u > 0.0 && constants[0] * tail <= SATURATION_TOLERANCE {
        return 1.0;
    }
    (constants[0] * total).clamp(0.0, 1.0)
}

/// Reweighted return density with its polynomial expanded once.
#[derive(Debug, Clone)]
pub struct ReweightedDensity {
    pub kind: DensityKind,
    mean: f64,
    normal: Normal,
    scale: f64,
    coefficients: Vec<f64>,
}

impl ReweightedDensity {
    pub fn new(moments: &Moments, kind: DensityKind) -> GlideResult<Self> {
        let (scale, coefficients) = polynomial(moments, kind);
        Ok(Self {
            kind,
            mean: moments.mean,
            normal: moments.normal()?,
            scale,
            coefficients,
        })
    }

    pub fn pdf(&self, x: f64) -> f64 {
        let u = x - self.mean;
        let poly = self.coefficients.iter().rev().fold(0.0, |acc, c| acc * u + c);
        self.scale * poly * self.normal.pdf(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{assert_close, scenario_params};

    fn numeric_cdf(moments: &Moments, kind: DensityKind, x: f64) -> f64 {
        let density = ReweightedDensity::new(moments, kind).expect("density");
        let lo = moments.mean - 14.0 * moments.variance.sqrt();
        let steps = 40_000;
        let dx = (x - lo) / steps as f64;
        (0..steps)
            .map(|i| density.pdf(lo + (i as f64 + 0.5) * dx) * dx)
            .sum()
    }

    #[test]
    fn selector_validation_rejects_bad_requests() {
        assert!(DensitySelector::gradient(3).validate(4).is_ok());
        assert_eq!(
            DensitySelector::gradient(4).validate(4),
            Err(GlidePathError::SelectorOutOfRange {
                index: 4,
                horizon: 4
            })
        );
        assert_eq!(
            DensitySelector::gradient_pair(2, 2).validate(4),
            Err(GlidePathError::OverlappingSelector { timepoint: 2 })
        );
        let both = DensitySelector {
            slots: [None, None, Some(1), Some(2)],
        };
        assert_eq!(
            both.validate(4),
            Err(GlidePathError::ConflictingHessianDensities { h1: 1, h2: 2 })
        );
    }

    #[test]
    fn selector_reports_kind_per_timepoint() {
        let pair = DensitySelector::gradient_pair(0, 2);
        assert_eq!(pair.kind_at(0), DensityKind::Gradient);
        assert_eq!(pair.kind_at(1), DensityKind::Standard);
        assert_eq!(pair.kind_at(2), DensityKind::Gradient);
        assert_eq!(
            DensitySelector::hessian_quartic(1).kind_at(1),
            DensityKind::HessianQuartic
        );
    }

    #[test]
    fn constant_vector_lengths_follow_density() {
        let moments = Moments::new(&scenario_params(), 0.6);
        assert_eq!(constants(&moments, &DensitySelector::standard(), 0).len(), 1);
        assert_eq!(constants(&moments, &DensitySelector::gradient(0), 0).len(), 4);
        assert_eq!(
            constants(&moments, &DensitySelector::hessian_quadratic(0), 0).len(),
            4
        );
        assert_eq!(
            constants(&moments, &DensitySelector::hessian_quartic(0), 0).len(),
            6
        );
        assert_eq!(auxiliary_variables(&DensitySelector::hessian_quartic(0), 0).len(), 4);
        assert!(auxiliary_variables(&DensitySelector::gradient(1), 0).is_empty());
    }

    #[test]
    fn standard_kind_reproduces_the_return_density() {
        let params = scenario_params();
        let moments = Moments::new(&params, 0.65);
        let standard = ReweightedDensity::new(&moments, DensityKind::Standard).expect("density");
        for x in [0.7, 1.0, 1.05, 1.3] {
            let expected = crate::core::returns::density(&params, 0.65, x).expect("density");
            assert_close(standard.pdf(x), expected, 1e-12);
        }
    }

    #[test]
    fn special_densities_are_non_negative_and_normalised() {
        let moments = Moments::new(&scenario_params(), 0.55);
        for kind in [
            DensityKind::Gradient,
            DensityKind::HessianQuadratic,
            DensityKind::HessianQuartic,
        ] {
            let hi = moments.mean + 14.0 * moments.variance.sqrt();
            assert_close(numeric_cdf(&moments, kind, hi), 1.0, 1e-6);
            for i in 0..200 {
                let x = moments.mean + (i as f64 - 100.0) * 0.01;
                assert!(
                    ReweightedDensity::new(&moments, kind).expect("density").pdf(x) >= 0.0,
                    "{kind:?} negative at {x}"
                );
            }
        }
    }

    #[test]
    fn closed_form_cdf_matches_numeric_integration() {
        let moments = Moments::new(&scenario_params(), 0.7);
        let normal = moments.normal().expect("valid normal");
        for (kind, selector) in [
            (DensityKind::Standard, DensitySelector::standard()),
            (DensityKind::Gradient, DensitySelector::gradient(0)),
            (
                DensityKind::HessianQuadratic,
                DensitySelector::hessian_quadratic(0),
            ),
            (DensityKind::HessianQuartic, DensitySelector::hessian_quartic(0)),
        ] {
            let c = constants(&moments, &selector, 0);
            let gammas = auxiliary_variables(&selector, 0);
            for x in [0.6, 0.9, 1.0, 1.05, 1.2, 1.5] {
                let closed = cdf(&moments, &c, &normal, gammas, x);
                assert_close(closed, numeric_cdf(&moments, kind, x), 1e-6);
            }
        }
    }

    #[test]
    fn cdf_saturates_to_exactly_one() {
        let moments = Moments::new(&scenario_params(), 0.8);
        let normal = moments.normal().expect("valid normal");
        let selector = DensitySelector::hessian_quartic(0);
        let c = constants(&moments, &selector, 0);
        let gammas = auxiliary_variables(&selector, 0);
        assert_eq!(cdf(&moments, &c, &normal, gammas, 5.0), 1.0);
        assert!(cdf(&moments, &c, &normal, gammas, -5.0) < 1e-12);
    }

    #[test]
    fn all_stock_cdf_saturates_at_top_of_reference_axis() {
        let moments = Moments::new(&scenario_params(), 1.0);
        let normal = moments.normal().expect("valid normal");
        for selector in [
            DensitySelector::gradient(0),
            DensitySelector::hessian_quadratic(0),
            DensitySelector::hessian_quartic(0),
        ] {
            let c = constants(&moments, &selector, 0);
            let gammas = auxiliary_variables(&selector, 0);
            assert_eq!(cdf(&moments, &c, &normal, gammas, 2.75), 1.0, "{selector:?}");
            assert!(cdf(&moments, &c, &normal, gammas, 1.6) < 1.0, "{selector:?}");
        }
    }
}
