//! Logging initialisation is safe to repeat.

use containai::logging::{init_cli, LogFormat};

#[test]
fn init_twice_does_not_panic() {
    init_cli(LogFormat::Json);
    init_cli(LogFormat::Text);
    tracing::info!(component = "test", "logging initialised");
}

#[test]
fn text_is_the_default_format() {
    assert_eq!(LogFormat::default(), LogFormat::Text);
}
