use std::fs::{self, File};
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, eyre};
use tracing_subscriber::EnvFilter;

/// Where diagnostics go and in which shape. Stdout stays reserved for
/// command output.
#[derive(Debug, Default, Clone)]
pub struct LogOptions {
    pub json: bool,
    pub file: Option<PathBuf>,
    /// Fallback directive when `RUST_LOG` is unset.
    pub level: Option<String>,
}

const DEFAULT_DIRECTIVE: &str = "info";

fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or(DEFAULT_DIRECTIVE)))
}

pub fn init_tracing(options: &LogOptions) -> Result<()> {
    let filter = env_filter(options.level.as_deref());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match (&options.file, options.json) {
        (Some(path), json) => {
            let file = open_log_file(path)?;
            let builder = builder.with_ansi(false).with_writer(move || {
                file.try_clone()
                    .map(LogSink::File)
                    .unwrap_or_else(|_| LogSink::Stderr(std::io::stderr()))
            });
            if json {
                builder.json().try_init()
            } else {
                builder.compact().try_init()
            }
        }
        (None, true) => builder
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .try_init(),
        (None, false) => builder.with_writer(std::io::stderr).compact().try_init(),
    };

    installed.map_err(|e| eyre!("failed to set tracing subscriber: {e}"))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(File::options().create(true).append(true).open(path)?)
}

/// Log writer that falls back to stderr when the file handle cannot be cloned.
enum LogSink {
    File(File),
    Stderr(std::io::Stderr),
}

impl std::io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            LogSink::File(f) => f.write(buf),
            LogSink::Stderr(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LogSink::File(f) => f.flush(),
            LogSink::Stderr(s) => s.flush(),
        }
    }
}
