//! Numeric domains for chart probabilities.
//!
//! The log domain stores natural-log probabilities in `f32`. The real domain
//! stores plain probabilities in `f64`, with a per-cell power-of-two scaling
//! step: a stored value `v` with step `s` stands for `v * 2^(-SCALE_BITS * s)`.

use std::fmt::Debug;

use crate::utils::log_sum;

/// Bits per scaling step. Values are rescaled when a cell's largest value
/// leaves `[2^-SCALE_BITS, 2^SCALE_BITS]`.
pub const SCALE_BITS: i32 = 100;

pub trait Domain: Copy + Debug + Default + Send + Sync + 'static {
  type Value: Copy + PartialOrd + Debug + Send + Sync;

  const ZERO: Self::Value;
  const ONE: Self::Value;
  const NAME: &'static str;

  /// Picks the representation of a rule weight, which grammars store in both forms.
  fn weight(log_prob: f32, prob: f64) -> Self::Value;

  fn times(a: Self::Value, b: Self::Value) -> Self::Value;

  fn plus(a: Self::Value, b: Self::Value) -> Self::Value;

  fn divide(a: Self::Value, b: Self::Value) -> Self::Value;

  /// Natural log of the true value, given the stored value and its scaling step.
  fn to_log(v: Self::Value, step: i32) -> f64;

  /// Stored form of a log probability at scaling step 0.
  fn from_log(log_prob: f64) -> Self::Value;

  /// Number of steps a cell whose largest value is `max` should be rescaled by.
  fn scaling_delta(max: Self::Value) -> i32;

  /// Multiplies by `2^(SCALE_BITS * steps)`; the identity in the log domain.
  fn scale(v: Self::Value, steps: i32) -> Self::Value;

  #[inline]
  fn is_zero(v: Self::Value) -> bool {
    v == Self::ZERO
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogDomain;

impl Domain for LogDomain {
  type Value = f32;

  const ZERO: f32 = f32::NEG_INFINITY;
  const ONE: f32 = 0.0;
  const NAME: &'static str = "log";

  #[inline]
  fn weight(log_prob: f32, _prob: f64) -> f32 {
    log_prob
  }

  #[inline]
  fn times(a: f32, b: f32) -> f32 {
    a + b
  }

  #[inline]
  fn plus(a: f32, b: f32) -> f32 {
    log_sum(a, b)
  }

  #[inline]
  fn divide(a: f32, b: f32) -> f32 {
    a - b
  }

  fn to_log(v: f32, _step: i32) -> f64 {
    v as f64
  }

  fn from_log(log_prob: f64) -> f32 {
    log_prob as f32
  }

  fn scaling_delta(_max: f32) -> i32 {
    0
  }

  fn scale(v: f32, _steps: i32) -> f32 {
    v
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealDomain;

impl RealDomain {
  fn step_factor() -> f64 {
    2f64.powi(SCALE_BITS)
  }
}

impl Domain for RealDomain {
  type Value = f64;

  const ZERO: f64 = 0.0;
  const ONE: f64 = 1.0;
  const NAME: &'static str = "real";

  #[inline]
  fn weight(_log_prob: f32, prob: f64) -> f64 {
    prob
  }

  #[inline]
  fn times(a: f64, b: f64) -> f64 {
    a * b
  }

  #[inline]
  fn plus(a: f64, b: f64) -> f64 {
    a + b
  }

  #[inline]
  fn divide(a: f64, b: f64) -> f64 {
    a / b
  }

  fn to_log(v: f64, step: i32) -> f64 {
    v.ln() - step as f64 * SCALE_BITS as f64 * std::f64::consts::LN_2
  }

  fn from_log(log_prob: f64) -> f64 {
    log_prob.exp()
  }

  fn scaling_delta(max: f64) -> i32 {
    if max <= 0.0 || !max.is_finite() {
      return 0;
    }
    let factor = Self::step_factor();
    let mut delta = 0;
    let mut m = max;
    while m < 1.0 / factor {
      m *= factor;
      delta += 1;
    }
    while m > factor {
      m /= factor;
      delta -= 1;
    }
    delta
  }

  fn scale(v: f64, steps: i32) -> f64 {
    let factor = Self::step_factor();
    let mut v = v;
    if steps > 0 {
      for _ in 0..steps {
        v *= factor;
      }
    } else {
      for _ in 0..-steps {
        v /= factor;
      }
    }
    v
  }
}
