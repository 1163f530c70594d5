use std::{env, io::Stdout};

use tracing_subscriber::{fmt::Layer, prelude::*, EnvFilter};

/// Initializes a new tracing configuration.
///
/// - `rust_log`: Used to set the RUST_LOG environment variable if it is not provided. You can set the default log level (e.g. `warn`),
///   but you can also configure module-specific log levels using comma-separated entries formatted like `path::to::module=log_level`, e.g.
///   `warn,hw_node=info,hw_node::console=debug`
///
/// Setting `JSON_LOGS` switches the output to one JSON object per event, which is what
/// we want when a batch bootstrap is run from CI and the logs are shipped elsewhere.
pub fn init_tracing(rust_log: &str) {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", rust_log);
    }

    let json_logs = env::var_os("JSON_LOGS").is_some();

    if json_logs {
        let layer = Layer::new()
            .with_writer(std::io::stdout as fn() -> Stdout)
            .with_target(true)
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .with_filter(EnvFilter::from_default_env());

        tracing_subscriber::registry().with(layer).init();
    } else {
        let layer = Layer::new()
            .with_writer(std::io::stdout as fn() -> Stdout)
            .with_target(true)
            .with_filter(EnvFilter::from_default_env());

        tracing_subscriber::registry().with(layer).init();
    }
}

/// Installs a subscriber that writes through the libtest capture.
///
/// Safe to call from every test, only the first call wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
