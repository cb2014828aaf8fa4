//! The pluggable compute workload.

/// A pure function of the request value.
///
/// The fabric does not care what the computation is; square root is the
/// placeholder workload. Implementations must be pure: no state, the same
/// input always produces the same output.
pub trait Workload: Send + Sync + 'static {
    fn apply(&self, value: f64) -> f64;
}

/// The default workload: `sqrt(value)`.
///
/// Applying it to a negative value yields NaN; by contract the reverse
/// proxy short-circuits negative requests before they reach a server.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqrt;

impl Workload for Sqrt {
    fn apply(&self, value: f64) -> f64 {
        value.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqrt_workload() {
        assert_eq!(Sqrt.apply(16.0), 4.0);
        assert_eq!(Sqrt.apply(0.0), 0.0);
        assert!((Sqrt.apply(10.0) - 3.1622776601683795).abs() < 1e-12);
    }

    #[test]
    fn test_sqrt_of_negative_is_nan() {
        assert!(Sqrt.apply(-2.5).is_nan());
    }
}
