//! Log sink for the watch binary: one append-only file per user, optionally
//! mirrored to stdout. stdout is otherwise reserved for the bell.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const LEVEL_VAR: &str = "INKSTREAM_LOG_LEVEL";

#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Empty disables the file.
    pub dir: String,
    pub user: String,
    pub mirror_stdout: bool,
}

#[derive(Clone, Default)]
pub struct LogSink {
    file: Option<Arc<Mutex<File>>>,
    mirror_stdout: bool,
}

impl LogSink {
    pub fn open(settings: &LogSettings) -> io::Result<Self> {
        let mut sink = Self {
            file: None,
            mirror_stdout: settings.mirror_stdout,
        };
        let dir = settings.dir.trim();
        if dir.is_empty() {
            return Ok(sink);
        }
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(Path::new(dir), &settings.user))?;
        sink.file = Some(Arc::new(Mutex::new(file)));
        Ok(sink)
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mirror_stdout {
            io::stdout().lock().write_all(buf)?;
        }
        if let Some(file) = &self.file {
            // A poisoned lock only means another writer panicked mid-line.
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.mirror_stdout {
            io::stdout().lock().flush()?;
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `INKSTREAM_LOG_LEVEL`.
/// A log file that cannot be opened is reported once and skipped.
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var(LEVEL_VAR).unwrap_or_else(|_| "info".to_string()))
    });
    let sink = LogSink::open(settings).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogSink {
            file: None,
            mirror_stdout: settings.mirror_stdout,
        }
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(sink)
        .try_init();
}

pub fn log_path(dir: &Path, user: &str) -> PathBuf {
    let user = user.trim();
    let name: String = if user.is_empty() { "anonymous" } else { user }
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    dir.join(format!("inkstream-watch-{name}.log"))
}
