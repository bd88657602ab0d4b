//! Millisecond-to-cycle quantization.
//!
//! Global Caché devices express IR durations as integer counts of modulation
//! carrier cycles, while RedRat keysets store real milliseconds. Naive
//! per-element rounding lets timing error accumulate across a long signal;
//! the quantizer here carries the rounding residual forward so the total
//! emitted duration stays within one carrier cycle of the source.

/// Quantize a millisecond sequence to integer modulation cycles.
///
/// Walks the sequence with a running residual: each element is converted to
/// cycles, the residual from the previous rounding is added, and the result
/// is rounded again. An element that rounds to zero is clamped to one cycle
/// and the borrowed cycle is charged to the residual, preserving the total
/// duration.
///
/// # Example
///
/// ```
/// use gcir_keyset::quantize::quantize_sequence;
///
/// // 0.25 ms and 1.0 ms at 40 kHz are exactly 10 and 40 cycles.
/// assert_eq!(quantize_sequence(&[0.25, 1.0], 40_000.0), vec![10, 40]);
/// ```
pub fn quantize_sequence(ms: &[f64], freq_hz: f64) -> Vec<u32> {
    let mut out = Vec::with_capacity(ms.len());
    let mut err = 0.0_f64;
    for &t_ms in ms {
        let x = t_ms * freq_hz / 1000.0 + err;
        let mut emitted = x.round();
        if emitted < 1.0 {
            emitted = 1.0;
        }
        err = x - emitted;
        out.push(emitted as u32);
    }
    out
}

/// Quantize a single millisecond value to cycles, unaccumulated.
///
/// Used for the intra-signal pause, which stands alone rather than being
/// part of a duration sequence.
pub fn quantize_single(ms: f64, freq_hz: f64) -> u32 {
    (ms * freq_hz / 1000.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_cycles_error(ms: &[f64], freq_hz: f64) -> f64 {
        let cycles = quantize_sequence(ms, freq_hz);
        let emitted: f64 = cycles.iter().map(|&c| c as f64).sum();
        let exact: f64 = ms.iter().map(|&t| t * freq_hz / 1000.0).sum();
        (emitted - exact).abs()
    }

    #[test]
    fn exact_durations_pass_through() {
        assert_eq!(quantize_sequence(&[0.25, 1.0], 40_000.0), vec![10, 40]);
    }

    #[test]
    fn residual_carries_to_next_element() {
        // 0.26 ms at 38 kHz = 9.88 cycles -> 10, residual -0.12.
        // Second 0.26 ms = 9.88 - 0.12 = 9.76 -> 10, residual -0.24.
        // Third = 9.88 - 0.24 = 9.64 -> 10, residual -0.36.
        // Fourth = 9.88 - 0.36 = 9.52 -> 10, residual -0.48.
        // Fifth = 9.88 - 0.48 = 9.40 -> 9.
        let cycles = quantize_sequence(&[0.26; 5], 38_000.0);
        assert_eq!(cycles, vec![10, 10, 10, 10, 9]);
    }

    #[test]
    fn drift_stays_under_one_cycle() {
        // Awkward fractional durations over a long sequence.
        let ms: Vec<f64> = (0..200)
            .map(|i| 0.137 + (i % 7) as f64 * 0.0531)
            .collect();
        for &freq in &[36_000.0, 38_400.0, 40_000.0] {
            assert!(
                total_cycles_error(&ms, freq) < 1.0,
                "drift >= 1 cycle at {freq} Hz"
            );
        }
    }

    #[test]
    fn zero_rounds_clamp_to_one() {
        // 0.002 ms at 38 kHz is 0.076 cycles: clamped to 1, with the
        // borrowed cycle paid back by the following element.
        let cycles = quantize_sequence(&[0.002, 1.0], 38_000.0);
        assert_eq!(cycles[0], 1);
        assert!(cycles.iter().all(|&c| c >= 1));
        assert!(total_cycles_error(&[0.002, 1.0], 38_000.0) < 1.0);
    }

    #[test]
    fn single_value_rounds_plainly() {
        assert_eq!(quantize_single(5.0, 40_000.0), 200);
        assert_eq!(quantize_single(0.49, 38_000.0), 19);
    }
}
