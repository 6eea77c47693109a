//! Structured logging, scoped per opened store.

use std::path::Path;

/// Initializes logging to a store-scoped folder: `{stem}_logs/{stem}.log`,
/// next to the store's own file.
pub fn init_for_store(store_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let stem = store_path.file_stem().and_then(|s| s.to_str()).unwrap_or("store");
    let base = store_path.parent().unwrap_or_else(|| Path::new("."));
    let log_dir = base.join(format!("{stem}_logs"));
    std::fs::create_dir_all(&log_dir)?;
    let logfile = log_dir.join(format!("{stem}.log"));

    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let file_appender = FileAppender::builder().encoder(encoder).build(logfile)?;
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Debug))?;
    // Re-initializing a handle is a no-op after the first call within a
    // process; the CLI and library both funnel through this entry point.
    let _ = log4rs::init_config(config);
    Ok(())
}
