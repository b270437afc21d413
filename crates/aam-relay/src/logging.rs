use crate::config::RelayConfig;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "aam-relay.log";

/// Log destination: stdout, plus `aam-relay.log` when a log dir is set.
#[derive(Clone, Default)]
pub struct LogSink {
    file: Option<Arc<Mutex<File>>>,
}

impl LogSink {
    pub fn open(log_dir: &str) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::default());
        }
        let dir = Path::new(log_dir);
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

pub struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            stdout: io::stdout(),
            file: self.file.clone(),
        }
    }
}

/// Installs the global subscriber. A log dir that cannot be opened falls
/// back to stdout only.
pub fn init(config: &RelayConfig) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("AAM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let sink = LogSink::open(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogSink::default()
    });
    let has_file = sink.has_file();
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink)
        .try_init();
    if installed.is_ok() && has_file {
        tracing::info!(event = "log_file_open", dir = %config.log_dir, file = LOG_FILE_NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_dir_writes_stdout_only() {
        assert!(!LogSink::open("  ").expect("sink").has_file());
    }

    #[test]
    fn records_are_appended_to_the_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("logs");
        let sink = LogSink::open(nested.to_str().expect("utf8 path")).expect("sink");
        assert!(sink.has_file());

        let mut writer = sink.make_writer();
        writer.write_all(b"relay_listen\n").expect("write");
        writer.flush().expect("flush");
        let mut again = sink.make_writer();
        again.write_all(b"relay_stop\n").expect("write");

        let contents = std::fs::read_to_string(nested.join(LOG_FILE_NAME)).expect("read log");
        assert_eq!(contents, "relay_listen\nrelay_stop\n");
    }
}
