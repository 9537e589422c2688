use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Runtime libraries underneath the orchestrator whose debug output would
/// drown the scheduling and commit lines; pinned to warn so `RUST_LOG=debug`
/// stays about lab orchestration.
const NOISY_TARGETS: [&str; 4] = ["mio", "actix_server", "tokio_util", "actix_rt"];

/// Where and how verbosely the orchestrator logs.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Directory holding the log file.
    pub dir: PathBuf,
    /// File name inside `dir`.
    pub file: String,
    /// Mirror log lines to stderr. Off for headless service runs where only
    /// the file sink matters.
    pub console: bool,
    /// Level used when `RUST_LOG` is unset.
    pub default_level: LevelFilter,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings { dir: PathBuf::from("logs"), file: "labflow.log".to_string(), console: true, default_level: LevelFilter::Info }
    }
}

static LOGGER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the global logger with default settings. Safe to call from
/// library entry points; later calls (e.g. several integration tests in one
/// binary) are no-ops.
pub fn init() {
    init_with(&LogSettings::default());
}

/// Installs the global logger.
///
/// The effective level comes from `RUST_LOG` when set, otherwise from the
/// settings. The console sink shows a short clock time and trims the crate
/// prefix off targets; the file sink keeps full dates and full targets for
/// correlating a run against its history CSV.
pub fn init_with(settings: &LogSettings) {
    if LOGGER_INSTALLED.set(()).is_err() {
        return;
    }

    let level = std::env::var("RUST_LOG").ok().and_then(|v| v.parse::<LevelFilter>().ok()).unwrap_or(settings.default_level);

    let mut root = Dispatch::new().level(level);
    for target in NOISY_TARGETS {
        root = root.level_for(target, LevelFilter::Warn);
    }

    if settings.console {
        let console = Dispatch::new()
            .format(|out, message, record| {
                let colors = fern::colors::ColoredLevelConfig::new()
                    .error(fern::colors::Color::Red)
                    .warn(fern::colors::Color::Yellow)
                    .info(fern::colors::Color::Green)
                    .debug(fern::colors::Color::Blue)
                    .trace(fern::colors::Color::BrightBlack);

                let target = record.target().trim_start_matches("labflow::domain::").trim_start_matches("labflow::");
                out.finish(format_args!("{} {:>5} {} {}", Local::now().format("%H:%M:%S"), colors.color(record.level()), target, message))
            })
            .chain(std::io::stderr());
        root = root.chain(console);
    }

    match open_log_file(settings) {
        Some(sink) => {
            let file = Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "[{} {} {}] {}",
                        Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                })
                .chain(sink);
            root = root.chain(file);
        }
        None => {
            if !settings.console {
                eprintln!("No log sink available: file could not be opened and the console is disabled.");
            }
        }
    }

    root.apply().unwrap_or_else(|e| {
        eprintln!("Failed to apply logger configuration: {}", e);
    });

    log::info!("Logger initialized at level {} (file sink: {}).", level, settings.dir.join(&settings.file).display());
}

fn open_log_file(settings: &LogSettings) -> Option<fern::Output> {
    if let Err(e) = fs::create_dir_all(&settings.dir) {
        eprintln!("Failed to create log directory '{}': {}; logging without a file sink.", settings.dir.display(), e);
        return None;
    }

    let path = settings.dir.join(&settings.file);
    match fern::log_file(&path) {
        Ok(sink) => Some(sink.into()),
        Err(e) => {
            eprintln!("Failed to open log file '{}': {}; logging without a file sink.", path.display(), e);
            None
        }
    }
}
