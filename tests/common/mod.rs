//! Common test utilities.

use prism::eval::Value;

/// Relative tolerance for f64 results. Device execution may reorder
/// float-associative work, so equivalence checks are tolerance-based, never
/// bitwise.
pub const EPSILON: f64 = 1e-9;

pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn approx_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= EPSILON * scale
}

/// Unwraps a scalar f64 value.
pub fn as_f64(value: &Value) -> f64 {
    value.as_f64().expect("expected an f64 value")
}

/// Unwraps field `k` of a record value as f64.
pub fn field_f64(value: &Value, k: usize) -> f64 {
    as_f64(&value.as_record().expect("expected a record value")[k])
}
