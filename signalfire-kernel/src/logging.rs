use crate::config::LogLevel;
use tracing_subscriber::EnvFilter;

/// Directive de filtre pour le niveau configuré.
/// tracing n'a pas de niveau fatal : fatal filtre comme error.
pub fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error | LogLevel::Fatal => "error",
    }
}

/// Installe le subscriber global. RUST_LOG, s'il est défini, l'emporte sur la config.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    // try_init : un second appel (tests) ne doit pas paniquer
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Équivalent d'un log fatal : erreur loggée puis arrêt du process
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1)
}
