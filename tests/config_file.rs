use turn_engine::config::{EngineConfig, SamplingProfile, UseCase};
use turn_engine::functions::FunctionRegistry;

#[test]
fn shipped_config_loads_and_validates() {
    let config = EngineConfig::from_file("turn-engine.toml").unwrap();
    config.validate().unwrap();

    assert_eq!(config.endpointing.use_case, UseCase::Standard);
    assert_eq!(config.endpointing.silence_threshold_ms(), 700);
    assert_eq!(config.sampling.profile, SamplingProfile::Conversational);
    assert_eq!(config.providers.generator, vec!["openai".to_string()]);

    let registry = FunctionRegistry::from_config(&config.functions);
    let args = registry
        .validate("get_order_status", r#"{"order_id": "A123"}"#)
        .unwrap();
    assert_eq!(args["order_id"], "A123");
    assert!(registry.validate("get_order_status", "{}").is_err());
}

#[test]
fn inconsistent_compression_is_rejected() {
    let config = EngineConfig::from_toml(
        "[context]\ncompress_threshold = 0.5\ncompress_target = 0.7\n",
    )
    .unwrap();
    assert!(config.validate().is_err());
}
