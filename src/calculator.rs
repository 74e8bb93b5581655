// Bolus calculator — carb and correction dosing from the active profile.

use crate::types::{GlucoseLevel, InsulinUnits, Profile};

/// Why a proposed bolus was judged unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolusRisk {
    OverMaximum,
    Stacking,
    LowGlucose,
}

pub fn carb_bolus(carbs: f64, carb_ratio: f64) -> InsulinUnits {
    if carb_ratio <= 0.0 || carbs <= 0.0 {
        return 0.0;
    }
    carbs / carb_ratio
}

/// Units needed to bring `glucose` down to `target`; zero at or below target.
pub fn correction_bolus(glucose: GlucoseLevel, target: GlucoseLevel, correction_factor: f64) -> InsulinUnits {
    if correction_factor <= 0.0 || glucose <= target {
        return 0.0;
    }
    (glucose - target) / correction_factor
}

/// Suggested dose for a meal. IOB only offsets the correction part, never
/// the carb part, and the result is clamped to `[0, max_bolus]`.
pub fn suggested_bolus(
    glucose: GlucoseLevel,
    carbs: f64,
    profile: &Profile,
    iob: InsulinUnits,
    max_bolus: InsulinUnits,
) -> InsulinUnits {
    let carb = carb_bolus(carbs, profile.carb_ratio);
    let correction = correction_bolus(glucose, profile.target_glucose, profile.correction_factor);
    let correction = (correction - iob.max(0.0)).max(0.0);
    (carb + correction).clamp(0.0, max_bolus.max(0.0))
}

/// Safety gate applied before offering a bolus.
pub fn check_bolus_safety(
    units: InsulinUnits,
    glucose: GlucoseLevel,
    iob: InsulinUnits,
    max_bolus: InsulinUnits,
) -> Result<(), BolusRisk> {
    if units > max_bolus {
        return Err(BolusRisk::OverMaximum);
    }
    if iob > 10.0 && units > 5.0 {
        return Err(BolusRisk::Stacking);
    }
    if glucose < 4.0 && units > 0.0 {
        return Err(BolusRisk::LowGlucose);
    }
    Ok(())
}

pub fn is_bolus_safe(units: InsulinUnits, glucose: GlucoseLevel, iob: InsulinUnits, max_bolus: InsulinUnits) -> bool {
    check_bolus_safety(units, glucose, iob, max_bolus).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile::new("Default", 1.0, 10.0, 2.0, 5.5)
    }

    #[test]
    fn test_carbs_only() {
        assert!((suggested_bolus(5.5, 60.0, &profile(), 0.0, 25.0) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_correction_offset_by_iob() {
        // correction = (9.5 - 5.5) / 2 = 2.0
        assert!((suggested_bolus(9.5, 0.0, &profile(), 0.0, 25.0) - 2.0).abs() < 1e-9);
        assert!((suggested_bolus(9.5, 0.0, &profile(), 0.5, 25.0) - 1.5).abs() < 1e-9);
        // IOB never eats into the carb part
        assert!((suggested_bolus(9.5, 30.0, &profile(), 5.0, 25.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_to_max() {
        assert_eq!(suggested_bolus(20.0, 400.0, &profile(), 0.0, 25.0), 25.0);
        assert_eq!(suggested_bolus(4.0, 0.0, &profile(), 0.0, 25.0), 0.0);
    }

    #[test]
    fn test_safety_rules() {
        assert_eq!(check_bolus_safety(26.0, 8.0, 0.0, 25.0), Err(BolusRisk::OverMaximum));
        assert_eq!(check_bolus_safety(6.0, 8.0, 11.0, 25.0), Err(BolusRisk::Stacking));
        assert_eq!(check_bolus_safety(1.0, 3.8, 0.0, 25.0), Err(BolusRisk::LowGlucose));
        assert!(is_bolus_safe(5.0, 8.0, 11.0, 25.0));
        assert!(is_bolus_safe(0.0, 3.0, 0.0, 25.0));
    }
}
