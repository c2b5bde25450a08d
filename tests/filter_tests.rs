use std::time::{Duration, Instant};
use tyretherm::config::FilterConfig;
use tyretherm::filter::TemporalFilter;

#[test]
fn test_step_response_is_slew_limited() {
    let mut filter = TemporalFilter::new(FilterConfig::with_max_rate(50.0));
    let t0 = Instant::now();
    let step = Duration::from_millis(100);

    let mut previous = filter.apply_at(20.0, t0);
    assert_eq!(previous, 20.0);

    // A 180 °C jump cannot move the output more than 50 °C/s × 0.1 s per sample.
    for i in 1..=10 {
        let out = filter.apply_at(200.0, t0 + step * i);
        assert!(out <= previous + 50.0 * 0.1 + 1e-3, "sample {}: {} after {}", i, out, previous);
        assert!(out > previous);
        previous = out;
    }

    // After a second of slewing the output has covered at most 50 °C.
    assert!(previous <= 70.0 + 1e-3);
}

#[test]
fn test_converges_when_rate_allows() {
    let mut filter = TemporalFilter::new(FilterConfig::with_max_rate(10_000.0));
    let t0 = Instant::now();
    filter.apply_at(0.0, t0);

    let mut out = 0.0;
    for i in 1..=40 {
        out = filter.apply_at(100.0, t0 + Duration::from_millis(20 * i));
    }
    assert!((out - 100.0).abs() < 0.1, "output {}", out);
}

#[test]
fn test_plausibility_clamp_applies_before_smoothing() {
    let config = FilterConfig {
        plausible_min: Some(0.0),
        plausible_max: Some(150.0),
        ..FilterConfig::with_max_rate(10_000.0)
    };
    let mut filter = TemporalFilter::new(config);
    let t0 = Instant::now();

    // A wild first sample seeds the filter at the plausible limit.
    assert_eq!(filter.apply_at(9_999.0, t0), 150.0);
    let out = filter.apply_at(-500.0, t0 + Duration::from_secs(1));
    assert!((out - 105.0).abs() < 1e-3, "output {}", out);
}

#[test]
fn test_downward_steps_are_limited_too() {
    let mut filter = TemporalFilter::new(FilterConfig::with_max_rate(20.0));
    let t0 = Instant::now();
    filter.apply_at(100.0, t0);
    let out = filter.apply_at(0.0, t0 + Duration::from_millis(500));
    assert!((out - 90.0).abs() < 1e-3);
}

#[test]
fn test_rejected_sample_before_seeding_passes_through() {
    let mut filter = TemporalFilter::new(FilterConfig::default());
    assert!(filter.apply(f32::NAN).is_nan());
    assert!(!filter.state().initialised);
    assert_eq!(filter.apply(30.0), 30.0);
}
