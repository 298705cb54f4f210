use crate::analyzers::types::StressBand;

/// Converts a composite stress score (0-100) into a band.
///
/// | Range       | Band     |
/// |-------------|----------|
/// | >= 75       | Severe   |
/// | >= 50       | High     |
/// | >= 25       | Moderate |
/// | < 25        | Low      |
pub fn stress_band(score: f64) -> StressBand {
    match score {
        s if s >= 75.0 => StressBand::Severe,
        s if s >= 50.0 => StressBand::High,
        s if s >= 25.0 => StressBand::Moderate,
        _ => StressBand::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        assert_eq!(stress_band(100.0), StressBand::Severe);
        assert_eq!(stress_band(75.0), StressBand::Severe);
        assert_eq!(stress_band(74.9), StressBand::High);
        assert_eq!(stress_band(50.0), StressBand::High);
        assert_eq!(stress_band(49.9), StressBand::Moderate);
        assert_eq!(stress_band(25.0), StressBand::Moderate);
        assert_eq!(stress_band(24.9), StressBand::Low);
        assert_eq!(stress_band(0.0), StressBand::Low);
    }
}
