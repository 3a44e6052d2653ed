use env_logger::{Builder, Env};

/// Install the global logger: `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
