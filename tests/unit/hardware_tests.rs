//! Unit tests for hardware profile helpers.

use longhaul::hardware::{HardwareDetector, HardwareProfile, StaticDetector};

#[test]
fn only_constrained_compresses() {
    assert!(HardwareProfile::Constrained.compress_checkpoints());
    for profile in [
        HardwareProfile::Development,
        HardwareProfile::Standard,
        HardwareProfile::HighCapacity,
    ] {
        assert!(!profile.compress_checkpoints(), "{profile}");
    }
}

#[test]
fn high_capacity_samples_less_often() {
    assert!(HardwareProfile::HighCapacity.sample_interval_scale() > 1.0);
    assert!((HardwareProfile::Standard.sample_interval_scale() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn names_parse_with_either_separator() {
    assert_eq!("high_capacity".parse::<HardwareProfile>().unwrap(), HardwareProfile::HighCapacity);
    assert_eq!("High-Capacity".parse::<HardwareProfile>().unwrap(), HardwareProfile::HighCapacity);
    assert!("tiny".parse::<HardwareProfile>().is_err());
}

#[test]
fn static_detector_reports_its_profile() {
    let detector = StaticDetector(HardwareProfile::Development);
    assert_eq!(detector.detect(), HardwareProfile::Development);
}
