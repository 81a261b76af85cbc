use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

/// Drops CSI colour sequences (`ESC [ ... letter`).
pub fn strip_ansi_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        for c in chars.by_ref() {
            if c.is_ascii_alphabetic() {
                break;
            }
        }
    }
    out
}

/// Log file capped at `max_lines`. Appends go straight to disk; the oldest
/// lines are cut once enough new ones piled up.
#[derive(Clone)]
pub(crate) struct CircularFileWriter {
    path: Arc<PathBuf>,
    max_lines: usize,
    pending: Arc<AtomicUsize>,
    prune_lock: Arc<Mutex<()>>,
}

impl CircularFileWriter {
    pub fn new(path: impl Into<PathBuf>, max_lines: u32) -> Self {
        Self {
            path: Arc::new(path.into()),
            max_lines: max_lines.max(1) as usize,
            pending: Arc::new(AtomicUsize::new(0)),
            prune_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 10% of the cap, at least 50 lines.
    fn prune_every(&self) -> usize {
        (self.max_lines / 10).max(50)
    }

    fn prune(&self) -> io::Result<()> {
        let _guard = self.prune_lock.lock();
        let contents = match fs::read_to_string(&*self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let total = contents.lines().count();
        if total <= self.max_lines {
            return Ok(());
        }
        let mut kept = String::with_capacity(contents.len());
        for line in contents.lines().skip(total - self.max_lines) {
            kept.push_str(line);
            kept.push('\n');
        }
        fs::write(&*self.path, kept)
    }
}

impl io::Write for CircularFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&*self.path)?
            .write_all(buf)?;

        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        let pending = self.pending.fetch_add(newlines, Ordering::Relaxed) + newlines;
        if pending >= self.prune_every() {
            self.pending.store(0, Ordering::Relaxed);
            if let Err(e) = self.prune() {
                eprintln!("Failed to prune log file: {}", e);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CircularFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
