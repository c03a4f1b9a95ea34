use std::fs;
use std::io::{self, Write};
use std::path::Path;

use num_bigint::BigUint;

/// On-disk program form: one decimal chunk per line, program order, no
/// header or trailer. Blank lines and `#` comments are tolerated on read.

#[derive(Debug)]
pub enum WireError {
    InvalidChunk { line: usize, text: String },
    Io(io::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::InvalidChunk { line, text } => {
                write!(f, "line {line}: invalid chunk '{text}'")
            }
            WireError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        WireError::Io(err)
    }
}

pub fn parse_chunks(text: &str) -> Result<Vec<BigUint>, WireError> {
    let mut chunks = Vec::new();
    for (line_idx, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let chunk =
            BigUint::parse_bytes(line.as_bytes(), 10).ok_or_else(|| WireError::InvalidChunk {
                line: line_idx + 1,
                text: line.to_string(),
            })?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

pub fn read_chunks_path(path: impl AsRef<Path>) -> Result<Vec<BigUint>, WireError> {
    let text = fs::read_to_string(path)?;
    parse_chunks(&text)
}

pub fn write_chunks(mut writer: impl Write, chunks: &[BigUint]) -> io::Result<()> {
    for chunk in chunks {
        writeln!(writer, "{chunk}")?;
    }
    Ok(())
}

pub fn write_chunks_path(path: impl AsRef<Path>, chunks: &[BigUint]) -> io::Result<()> {
    let mut out = Vec::new();
    write_chunks(&mut out, chunks)?;
    fs::write(path, out)
}

/// Whether `text` is a persisted chunk list rather than assembly source:
/// every significant line is an unsigned decimal integer.
pub fn looks_like_chunks(text: &str) -> bool {
    let mut significant = 0usize;
    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        significant += 1;
        if !line.bytes().all(|byte| byte.is_ascii_digit()) {
            return false;
        }
    }
    significant > 0
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}
