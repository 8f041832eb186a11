use serde::{Deserialize, Serialize};
use std::fmt;

/// The loss families the booster can optimize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Gaussian,
    Bernoulli,
    ModifiedHuber,
    Multinomial,
    Poisson,
    Gamma,
    Tweedie,
    Laplace,
    Quantile,
    Huber,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A distribution is a family plus the knobs some families carry: the
/// tweedie variance power, the target quantile, and the per-round huber
/// cutoff (set by the driver once the residual quantile is known).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub family: Family,
    pub tweedie_power: f64,
    pub quantile_alpha: f64,
    pub huber_delta: f64,
}

impl Distribution {
    pub fn new(family: Family) -> Self {
        Distribution {
            family,
            tweedie_power: 1.5,
            quantile_alpha: 0.5,
            huber_delta: 1.0,
        }
    }

    pub fn set_huber_delta(&mut self, delta: f64) {
        self.huber_delta = delta;
    }

    /// Canonical link, applied to mean-scale values.
    pub fn link(&self, x: f64) -> f64 {
        match self.family {
            Family::Bernoulli | Family::ModifiedHuber => (x / (1.0 - x)).ln(),
            Family::Multinomial | Family::Poisson | Family::Gamma | Family::Tweedie => x.ln(),
            _ => x,
        }
    }

    /// Inverse link, applied to link-scale values.
    pub fn link_inv(&self, x: f64) -> f64 {
        match self.family {
            Family::Bernoulli | Family::ModifiedHuber => 1.0 / (1.0 + (-x).exp()),
            Family::Multinomial | Family::Poisson | Family::Gamma | Family::Tweedie => x.exp(),
            _ => x,
        }
    }

    /// Negative half-gradient of the deviance at (y, f), f in link space.
    /// This is what the residual pass writes into the work columns.
    pub fn neg_half_gradient(&self, y: f64, f: f64) -> f64 {
        match self.family {
            Family::Gaussian => y - f,
            Family::Bernoulli => y - self.link_inv(f),
            Family::ModifiedHuber => {
                let yy = 2.0 * y - 1.0;
                let yf = yy * f;
                if yf < -1.0 {
                    2.0 * yy
                } else if yf > 1.0 {
                    0.0
                } else {
                    yy * (1.0 - yf)
                }
            }
            // The driver computes multinomial residuals from the full
            // softmax over all class trees; the per-class form is y - p.
            Family::Multinomial => y - self.link_inv(f),
            Family::Poisson => y - f.exp(),
            Family::Gamma => y * (-f).exp() - 1.0,
            Family::Tweedie => {
                y * (f * (1.0 - self.tweedie_power)).exp() - (f * (2.0 - self.tweedie_power)).exp()
            }
            Family::Laplace => {
                if y > f {
                    1.0
                } else if y < f {
                    -1.0
                } else {
                    0.0
                }
            }
            Family::Quantile => {
                if y > f {
                    self.quantile_alpha
                } else {
                    self.quantile_alpha - 1.0
                }
            }
            Family::Huber => {
                let r = y - f;
                if r.abs() <= self.huber_delta {
                    r
                } else {
                    self.huber_delta * r.signum()
                }
            }
        }
    }

    /// Numerator contribution of one row to its leaf's gamma estimate.
    /// `z` is the stored residual, `f` the current prediction (link space).
    pub fn gamma_num(&self, w: f64, y: f64, z: f64, f: f64) -> f64 {
        match self.family {
            Family::Gaussian | Family::Bernoulli | Family::Multinomial => w * z,
            Family::Poisson => w * y,
            Family::Gamma => w * (z + 1.0), // z + 1 == y * exp(-f)
            Family::Tweedie => w * y * (f * (1.0 - self.tweedie_power)).exp(),
            Family::ModifiedHuber => {
                let yy = 2.0 * y - 1.0;
                let yf = yy * f;
                if yf < -1.0 {
                    w * 4.0 * yy
                } else if yf > 1.0 {
                    0.0
                } else {
                    w * 2.0 * yy * (1.0 - yf)
                }
            }
            // Laplace/Quantile/Huber leaves are fitted by the quantile
            // passes, not the closed form.
            _ => 0.0,
        }
    }

    /// Denominator contribution of one row to its leaf's gamma estimate.
    pub fn gamma_denom(&self, w: f64, y: f64, z: f64, f: f64) -> f64 {
        match self.family {
            Family::Gaussian => w,
            Family::Bernoulli => {
                let p = y - z;
                w * p * (1.0 - p)
            }
            Family::Multinomial => {
                let az = z.abs();
                w * az * (1.0 - az)
            }
            Family::Poisson => w * (y - z), // y - z == exp(f)
            Family::Gamma => w,
            Family::Tweedie => w * (f * (2.0 - self.tweedie_power)).exp(),
            Family::ModifiedHuber => w * 4.0,
            _ => 0.0,
        }
    }

    /// Initial constant prediction in link space, from the weighted
    /// response mean. Median-like families start at the driver-computed
    /// quantile instead and multinomial always starts at zero.
    pub fn init_f_from_mean(&self, ymean: f64) -> f64 {
        match self.family {
            Family::Gaussian => ymean,
            Family::Bernoulli | Family::ModifiedHuber => self.link(ymean),
            Family::Poisson | Family::Gamma | Family::Tweedie => ymean.ln(),
            _ => 0.0,
        }
    }

    pub fn is_classifier(&self) -> bool {
        matches!(
            self.family,
            Family::Bernoulli | Family::ModifiedHuber | Family::Multinomial
        )
    }

    /// Leaf values come from a stratified quantile rather than the
    /// closed-form gamma.
    pub fn needs_quantile_fit(&self) -> bool {
        matches!(self.family, Family::Laplace | Family::Quantile)
    }

    pub fn needs_huber_fit(&self) -> bool {
        self.family == Family::Huber
    }

    /// Log-space families need their leaf predictions truncated to avoid
    /// exp() overflow when scoring.
    pub fn truncate_log_space(&self) -> bool {
        matches!(self.family, Family::Poisson | Family::Gamma | Family::Tweedie)
    }
}
