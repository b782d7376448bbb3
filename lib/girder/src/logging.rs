pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger. Components derive their own child
/// loggers from the returned root with `log.new(o!())`.
pub fn init() -> Logger {
    init_with_level("debug")
}

/// Builds a terminal logger with the supplied minimum severity level.
pub fn init_with_level(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_levels() {
        let logger = init_with_level("info");
        info!(logger, "logger constructed"; "level" => "info");
    }
}
