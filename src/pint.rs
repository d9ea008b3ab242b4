//! PINT compressed utilisation codec.
//!
//! A path's utilisation is carried as a single logarithmically quantised
//! code. The top code maps to `u = 1.0`; each step below divides by the log
//! base, so relative error is bounded by half a step everywhere in `(0, 1]`.

/// Width of the carried power code.
const N_BITS: u32 = 8;
/// Quantisation base.
const LOG_BASE: f64 = 1.05;
/// Code for `u = 1.0`.
const TOP_CODE: u16 = (1 << N_BITS) - 1;

/// Quantises a utilisation `u ∈ (0, 1]` into a power code.
pub fn encode_u(u: f64) -> u16 {
    if u <= 0.0 {
        return 0;
    }
    let steps = (u.ln() / LOG_BASE.ln()).round();
    let code = f64::from(TOP_CODE) + steps;
    code.clamp(0.0, f64::from(TOP_CODE)) as u16
}

/// Expands a power code back into a utilisation estimate.
pub fn decode_u(power: u16) -> f64 {
    let power = power.min(TOP_CODE);
    LOG_BASE.powi(i32::from(power) - i32::from(TOP_CODE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_code_is_full_utilisation() {
        assert_eq!(encode_u(1.0), TOP_CODE);
        assert!((decode_u(TOP_CODE) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn round_trip_within_one_step() {
        for &u in &[1.0, 0.95, 0.5, 0.1, 0.01] {
            let decoded = decode_u(encode_u(u));
            let ratio = decoded / u;
            assert!(
                ratio > 1.0 / LOG_BASE && ratio < LOG_BASE,
                "u={u} decoded={decoded}"
            );
        }
    }

    #[test]
    fn degenerate_inputs_clamp() {
        assert_eq!(encode_u(0.0), 0);
        assert_eq!(encode_u(-1.0), 0);
        assert_eq!(encode_u(2.0), TOP_CODE);
        assert!(decode_u(0) < 1e-5);
    }
}
