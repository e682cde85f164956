use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Maps a level name onto a tracing level. Unknown names fall back to info.
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout carries only
/// results.
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
