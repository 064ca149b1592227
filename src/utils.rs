/// Adds two log-domain probabilities.
///
/// ```
/// let p = sparsecky::utils::log_sum(0.5f32.ln(), 0.25f32.ln());
/// assert!((p - 0.75f32.ln()).abs() < 1e-6);
/// ```
pub fn log_sum(a: f32, b: f32) -> f32 {
  if a == f32::NEG_INFINITY {
    return b;
  }
  if b == f32::NEG_INFINITY {
    return a;
  }
  let (hi, lo) = if a > b { (a, b) } else { (b, a) };
  // beyond this the smaller term vanishes in f32 precision
  if hi - lo > 20.0 {
    hi
  } else {
    hi + (lo - hi).exp().ln_1p()
  }
}

/// f64 variant of [`log_sum`], used where counts accumulate over many sentences.
pub fn log_sum_f64(a: f64, b: f64) -> f64 {
  if a == f64::NEG_INFINITY {
    return b;
  }
  if b == f64::NEG_INFINITY {
    return a;
  }
  let (hi, lo) = if a > b { (a, b) } else { (b, a) };
  hi + (lo - hi).exp().ln_1p()
}

/// Sums a sequence of log-domain values.
pub fn log_sum_all<I: IntoIterator<Item = f32>>(values: I) -> f32 {
  values.into_iter().fold(f32::NEG_INFINITY, log_sum)
}

/// Number of bits needed to represent `n - 1`, i.e. to index `n` values.
pub fn bits_for(n: usize) -> u32 {
  if n <= 1 {
    1
  } else {
    usize::BITS - (n - 1).leading_zeros()
  }
}

pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
  if a == b {
    return true;
  }
  (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
}

#[test]
fn test_log_sum_identities() {
  assert_eq!(log_sum(f32::NEG_INFINITY, -2.0), -2.0);
  assert_eq!(log_sum(-2.0, f32::NEG_INFINITY), -2.0);
  assert!((log_sum(0.0, 0.0) - 2f32.ln()).abs() < 1e-6);
  assert!((log_sum_all([0.1f32.ln(), 0.2f32.ln(), 0.3f32.ln()]) - 0.6f32.ln()).abs() < 1e-6);
  assert!((log_sum_f64(0.5f64.ln(), 0.5f64.ln())).abs() < 1e-12);
}

#[test]
fn test_bits_for() {
  assert_eq!(bits_for(1), 1);
  assert_eq!(bits_for(2), 1);
  assert_eq!(bits_for(3), 2);
  assert_eq!(bits_for(256), 8);
  assert_eq!(bits_for(257), 9);
}
