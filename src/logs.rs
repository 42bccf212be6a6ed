//! Log capture and log reading for managed services.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process::Stdio,
};

use chrono::Local;

use crate::constants::{LAUNCH_MARKER_PREFIX, ServiceName};

/// Append-only log artifact receiving a service's stdout and stderr.
#[derive(Debug, Clone)]
pub struct LogSink {
    service: ServiceName,
    path: PathBuf,
}

impl LogSink {
    /// Creates a sink writing to `path`.
    pub fn new(service: ServiceName, path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            path: path.into(),
        }
    }

    /// Log artifact path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the artifact; launches use it as the tail start position.
    pub fn len(&self) -> u64 {
        fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0)
    }

    /// Whether the artifact is missing or empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens the artifact for appending and returns stdout/stderr handles for a child.
    ///
    /// A marker line is written first so successive launches are distinguishable.
    pub fn open(&self) -> io::Result<(Stdio, Stdio)> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{} at {} ---",
            launch_marker(self.service),
            Local::now().to_rfc3339()
        )?;

        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

/// Marker identifying the start of a launch of `service` in its log.
pub fn launch_marker(service: ServiceName) -> String {
    format!("{LAUNCH_MARKER_PREFIX} {service}")
}

/// Source of log lines that appeared since the last read.
pub trait LogSource {
    /// Returns complete lines written since the previous call.
    fn read_new_lines(&mut self) -> io::Result<Vec<String>>;
}

/// Incremental reader over a growing log artifact.
///
/// Partial trailing lines are buffered until their newline arrives. A missing file
/// yields no lines; a file that shrank is read again from the start.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    position: u64,
    partial: String,
}

impl LogTail {
    /// Tails `path` from the beginning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_position(path, 0)
    }

    /// Tails `path` starting at byte `position`.
    pub fn from_position(path: impl Into<PathBuf>, position: u64) -> Self {
        Self {
            path: path.into(),
            position,
            partial: String::new(),
        }
    }

    /// Byte offset consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl LogSource for LogTail {
    fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let len = file.metadata()?.len();
        if len < self.position {
            self.position = 0;
            self.partial.clear();
        }
        if len == self.position {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.position))?;
        let mut bytes = Vec::with_capacity((len - self.position) as usize);
        file.take(len - self.position).read_to_end(&mut bytes)?;
        self.position += bytes.len() as u64;
        self.partial.push_str(&String::from_utf8_lossy(&bytes));

        let mut lines = Vec::new();
        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        Ok(lines)
    }
}

/// Block size used when reading an artifact from its end.
pub const BACKWARD_CHUNK: u64 = 8 * 1024;

/// Returns the last `lines` lines of the artifact at `path`.
///
/// Only the end of the artifact is read. Invalid UTF-8 is replaced, never fatal.
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let mut start = file.metadata()?.len();
    let mut bytes = Vec::new();

    // One newline beyond `lines` guarantees the first kept line is complete.
    while start > 0 && bytes.iter().filter(|byte| **byte == b'\n').count() <= lines {
        let chunk_start = start.saturating_sub(BACKWARD_CHUNK);
        let mut chunk = read_range(&mut file, chunk_start, start)?;
        chunk.extend_from_slice(&bytes);
        bytes = chunk;
        start = chunk_start;
    }

    let text = String::from_utf8_lossy(&bytes);
    let all_lines: Vec<&str> = text.lines().collect();
    let first = all_lines.len().saturating_sub(lines);
    Ok(all_lines[first..].iter().map(|line| line.to_string()).collect())
}

/// Byte offset of the last occurrence of `needle` in the artifact at `path`.
///
/// The artifact is searched backwards block by block, so a match near the end is
/// found without reading the rest.
pub fn last_offset_of(path: &Path, needle: &str) -> io::Result<Option<u64>> {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut end = file.metadata()?.len();
    let mut carry = Vec::new();
    while end > 0 {
        let start = end.saturating_sub(BACKWARD_CHUNK);
        let mut window = read_range(&mut file, start, end)?;
        // Carry the head of the later block so matches across the boundary count.
        window.extend_from_slice(&carry);
        if let Some(index) = window
            .windows(needle.len())
            .rposition(|candidate| candidate == needle)
        {
            return Ok(Some(start + index as u64));
        }
        let keep = (needle.len() - 1).min(window.len());
        carry = window[..keep].to_vec();
        end = start;
    }
    Ok(None)
}

fn read_range(file: &mut File, start: u64, end: u64) -> io::Result<Vec<u8>> {
    let mut bytes = vec![0; (end - start) as usize];
    file.seek(SeekFrom::Start(start))?;
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Prints the last `lines` lines of a service's log to stdout.
pub fn show_logs(service: ServiceName, path: &Path, lines: usize) -> io::Result<()> {
    if !path.exists() {
        println!("No log for '{service}' at {}", path.display());
        return Ok(());
    }

    println!("==> {service} ({}) <==", path.display());
    for line in tail_lines(path, lines)? {
        println!("{line}");
    }
    Ok(())
}
