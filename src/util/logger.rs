use log::SetLoggerError;

/// The environment variable that holds the log filter, e.g. `SANDMARK_LOG=debug`.
pub const LOG_FILTER_ENV: &str = "SANDMARK_LOG";

/// Attempt to init an env_logger for sandmark.
/// Does nothing if the "builtin_env_logger" feature is disabled, so an embedder can install
/// its own `log` implementation instead.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::default().filter_or(LOG_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
