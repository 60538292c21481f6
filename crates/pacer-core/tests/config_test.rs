use pacer_core::config::EngineConfig;

#[test]
fn default_config() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.step.max_steps, 12);
    assert_eq!(cfg.step.window_size, 6);
    assert_eq!(cfg.step.anchor_interval, 5);
    assert_eq!(cfg.step.max_context_tokens, 60_000);
    assert_eq!(cfg.compression.threshold_chars, 2_000);
    assert_eq!(cfg.compression.condensed_max_chars, 600);
    assert_eq!(cfg.compression.cache_capacity, 200);
    assert!(cfg.routing.enabled);
    assert_eq!(cfg.routing.confidence_threshold, 0.75);
    assert!(cfg.routing.budget_pressure_downgrade);
    assert!(cfg.routing.tiers.fast.is_none());
    assert_eq!(cfg.budget.reservation_max_age_minutes, 30);
    assert_eq!(cfg.budget.alert_window_minutes, 60);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = EngineConfig::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("max_steps"));

    let parsed: EngineConfig = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.step.max_steps, cfg.step.max_steps);
    assert_eq!(parsed.compression.cache_capacity, cfg.compression.cache_capacity);
    assert_eq!(parsed.budget.alert_window_minutes, cfg.budget.alert_window_minutes);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[step]
max_steps = 3

[routing.tiers]
fast = "small-v1"
"#;
    let cfg: EngineConfig = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.step.max_steps, 3);
    assert_eq!(cfg.routing.tiers.fast.as_deref(), Some("small-v1"));
    // defaults should fill in the rest
    assert_eq!(cfg.step.window_size, 6);
    assert_eq!(cfg.compression.threshold_chars, 2_000);
    cfg.validate().expect("config validates");
}

#[test]
fn zero_max_steps_fails_validation() {
    let mut cfg = EngineConfig::default();
    cfg.step.max_steps = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_steps"));
}

#[test]
fn out_of_range_confidence_fails_validation() {
    let mut cfg = EngineConfig::default();
    cfg.routing.confidence_threshold = 1.5;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("confidence_threshold"));
}

#[test]
fn non_positive_reservation_age_fails_validation() {
    let mut cfg = EngineConfig::default();
    cfg.budget.reservation_max_age_minutes = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("reservation_max_age_minutes"));
}

#[test]
fn rejection_names_the_violated_rule() {
    let mut cfg = EngineConfig::default();
    cfg.compression.cache_capacity = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert_eq!(
        err.to_string(),
        "config validation error: compression.cache_capacity must be at least 1"
    );
}
