pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Builds the process-wide terminal logger. The configuration is expressed
/// as a `sloggers` document so file/syslog outputs can be swapped in without
/// touching call sites.
pub fn init(level: &str) -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("invalid logger configuration");

    config.build_logger().expect("failed to build logger")
}

/// A logger that discards everything. Used by tests and optional components.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
