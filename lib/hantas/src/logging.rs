pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger used by tools and examples embedding
/// the library. Library components never call this themselves; they take a
/// parent `Logger` and derive children from it.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("default logger config must parse");

    config.build_logger().expect("terminal logger must build")
}

/// A logger that swallows everything. Default for components constructed
/// without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger_accepts_records() {
        let log = discard();
        debug!(log, "no-op"; "value" => 1);
    }

    #[test]
    fn test_init_builds_terminal_logger() {
        let log = init();
        trace!(log, "logger built");
    }
}
