use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use flate2::{write::GzEncoder, Compression};
use parking_lot::Mutex;
use tracing::warn;
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_PREFIX: &str = "widesync";
const ACTIVE_FILE_NAME: &str = "widesync.log";
const MAX_RETAINED_LOGS: usize = 10;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber: stdout plus a daily-rotated, gzip
/// compressed log file under `log_dir`. Safe to call more than once.
pub fn init(log_dir: &Path) -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let writer = RollingWriter::open(log_dir.to_path_buf())?;
    let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(writer);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_ansi(false),
        );

    match subscriber.try_init() {
        Ok(_) => {
            let _ = FILE_GUARD.set(guard);
            install_panic_hook();
        }
        Err(_) => {
            // Another subscriber is already installed (tests); let the
            // worker thread exit.
            drop(guard);
        }
    }

    Ok(())
}

#[derive(Clone)]
struct RollingWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    log_dir: PathBuf,
    state: Mutex<WriterState>,
}

struct WriterState {
    file: Option<BufWriter<fs::File>>,
    current_day: NaiveDate,
}

impl RollingWriter {
    fn open(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

        let now = Local::now();
        let active = log_dir.join(ACTIVE_FILE_NAME);
        if stale_since(&active, now)? {
            roll_aside(&log_dir, &active, now);
        }

        let state = WriterState {
            file: Some(open_append(&active)?),
            current_day: now.date_naive(),
        };

        Ok(Self {
            inner: Arc::new(WriterInner {
                log_dir,
                state: Mutex::new(state),
            }),
        })
    }

    fn active_path(&self) -> PathBuf {
        self.inner.log_dir.join(ACTIVE_FILE_NAME)
    }

    fn rotate(&self, state: &mut WriterState, now: DateTime<Local>) {
        if let Some(mut file) = state.file.take() {
            let _ = file.flush();
        }

        let active = self.active_path();
        if active.exists() {
            roll_aside(&self.inner.log_dir, &active, now);
        }

        match open_append(&active) {
            Ok(file) => {
                state.file = Some(file);
                state.current_day = now.date_naive();
            }
            Err(err) => eprintln!("failed to reopen log file after rotation: {err:?}"),
        }
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let now = Local::now();
        let mut state = self.inner.state.lock();

        if now.date_naive() != state.current_day {
            self.rotate(&mut state, now);
        }

        if state.file.is_none() {
            state.file = Some(open_append(&self.active_path()).map_err(io::Error::other)?);
            state.current_day = now.date_naive();
        }

        match state.file.as_mut() {
            Some(file) => {
                file.write_all(buf)?;
                Ok(buf.len())
            }
            None => Err(io::Error::other("log writer unavailable")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        match state.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn open_append(path: &Path) -> Result<BufWriter<fs::File>> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Whether the active log file was last written on a previous day.
fn stale_since(path: &Path, now: DateTime<Local>) -> Result<bool> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("unable to inspect log file {}", path.display()))
        }
    };
    let modified = metadata
        .modified()
        .ok()
        .map(DateTime::<Local>::from)
        .map(|at| at.date_naive());
    Ok(modified.map(|day| day != now.date_naive()).unwrap_or(true))
}

/// Rename the active file to a dated name, compress it, and trim retention.
fn roll_aside(log_dir: &Path, active: &Path, stamp: DateTime<Local>) {
    let rotated = unique_rotated_path(log_dir, stamp);
    if let Err(err) = fs::rename(active, &rotated) {
        eprintln!(
            "failed to rotate log {} -> {}: {err}",
            active.display(),
            rotated.display()
        );
        return;
    }
    if let Err(err) = compress_file(&rotated) {
        warn!("failed to compress rotated log {}: {}", rotated.display(), err);
    }
    if let Err(err) = enforce_retention(log_dir) {
        warn!("failed to enforce log retention in {}: {}", log_dir.display(), err);
    }
}

fn unique_rotated_path(dir: &Path, stamp: DateTime<Local>) -> PathBuf {
    let base = format!("{}_{}", LOG_PREFIX, stamp.format("%Y-%m-%d"));
    let mut candidate = dir.join(format!("{base}.log"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{base}-{counter}.log"));
        counter += 1;
    }
    candidate
}

fn compress_file(path: &Path) -> Result<()> {
    let gz_path = path.with_extension("log.gz");
    let mut input = fs::File::open(path)
        .with_context(|| format!("failed to open {} for compression", path.display()))?;
    let output = fs::File::create(&gz_path)
        .with_context(|| format!("failed to create {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("failed to compress {}", path.display()))?;
    encoder
        .finish()
        .with_context(|| format!("failed to finish compression for {}", gz_path.display()))?;
    drop(input);
    fs::remove_file(path)
        .with_context(|| format!("failed to remove uncompressed log {}", path.display()))?;
    Ok(())
}

fn enforce_retention(log_dir: &Path) -> Result<()> {
    let mut rotated: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("failed to list log directory {}", log_dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if path.is_file() && name.starts_with(LOG_PREFIX) && name != ACTIVE_FILE_NAME {
            rotated.push(path);
        }
    }

    // Dated file names sort chronologically; drop the oldest first.
    rotated.sort();
    while rotated.len() > MAX_RETAINED_LOGS {
        let path = rotated.remove(0);
        if let Err(err) = fs::remove_file(&path) {
            warn!("failed to remove expired log {}: {}", path.display(), err);
        }
    }

    Ok(())
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;
    use tempfile::tempdir;

    #[test]
    fn rotates_and_compresses_when_day_changes() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        let mut writer = RollingWriter::open(dir.clone()).unwrap();

        writer.write_all(b"first line\n").unwrap();
        writer.flush().unwrap();

        {
            let mut state = writer.inner.state.lock();
            state.current_day = state.current_day - Days::new(1);
        }

        writer.write_all(b"second line\n").unwrap();
        writer.flush().unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name == ACTIVE_FILE_NAME));
        assert!(
            names.iter().any(|name| name.ends_with(".log.gz")),
            "expected a compressed rotated log, found {names:?}"
        );
    }
}
