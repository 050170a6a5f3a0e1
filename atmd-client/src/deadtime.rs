//! Deadtime estimate for network readout.
//!
//! Hits of one window are read out in packets sent in TDMA cycles shared by
//! `tdma_slots` agents:
//!
//! ```text
//! packets = ceil((counts * window_time - 163) / 165)
//! cycles  = packets / tdma_slots
//! deadtime = cycles * cycle
//! ```

/// Deadtime needed to read out one window, in the unit of `cycle`.
///
/// `counts` is the expected hit rate and `window_time` the window length in
/// matching units, so their product is the number of hits per window.
/// Returns `None` if `tdma_slots` is not positive or the result is not a
/// finite number.
pub fn estimate(counts: f64, window_time: f64, tdma_slots: f64, cycle: f64) -> Option<f64> {
    if tdma_slots <= 0.0 || tdma_slots.is_nan() {
        return None;
    }
    let packets = ((counts * window_time - 163.0) / 165.0).ceil();
    let deadtime = packets / tdma_slots * cycle;
    deadtime.is_finite().then_some(deadtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_estimate() {
        // 1000 hits -> ceil(837 / 165) = 6 packets over 2 slots -> 3 cycles
        let dt = estimate(100.0, 10.0, 2.0, 1.5).unwrap();
        assert_relative_eq!(dt, 4.5);
    }

    #[test]
    fn test_single_packet() {
        let dt = estimate(1.0, 163.0, 1.0, 10.0).unwrap();
        assert_relative_eq!(dt, 0.0);
        let dt = estimate(1.0, 164.0, 1.0, 10.0).unwrap();
        assert_relative_eq!(dt, 10.0);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(estimate(100.0, 10.0, 0.0, 1.0), None);
        assert_eq!(estimate(100.0, 10.0, -4.0, 1.0), None);
        assert_eq!(estimate(f64::NAN, 10.0, 2.0, 1.0), None);
        assert_eq!(estimate(100.0, 10.0, 2.0, f64::INFINITY), None);
    }
}
