use log::LevelFilter;
use std::io::Write;

/// Level implied by the number of `-v` flags
pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// Initialize the logging system
///
/// Diagnostics go to stderr so command output on stdout stays clean for
/// `--json` and shell completions. The level comes from `-v` (warn, info,
/// debug); `RUST_LOG`, when set to a valid filter, wins.
///
/// ```bash
/// RUST_LOG=debug gitprof switch work
/// ```
pub fn init_logger(verbose: u8) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or_else(|| level_for_verbosity(verbose));

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:5}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .try_init()
        .ok(); // already initialized
}
