use wsagent_config::{init_tracing, LoggingConfig};

#[test]
fn init_tracing_is_idempotent() {
    let config = LoggingConfig {
        level: "wsagent.config=debug".into(),
        ..LoggingConfig::default()
    };

    init_tracing(&config);
    init_tracing(&LoggingConfig::default());

    tracing::info!(target: "wsagent.config", "tracing initialized twice");
}
