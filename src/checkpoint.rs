use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::memory::MemoryImage;
use crate::vm::Frame;

/// Full VM state at a CHECKPOINT instruction. `program_hash` ties the
/// snapshot to the exact chunk list it was taken from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub program_hash: String,
    pub ip: usize,
    pub stack: Vec<BigInt>,
    pub memory: MemoryImage,
    pub frames: Vec<Frame>,
}

#[derive(Debug)]
pub enum CheckpointError {
    Serialize(String),
    Io(String),
    ProgramMismatch { expected: String, found: String },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::Serialize(message) => write!(f, "snapshot encoding: {message}"),
            CheckpointError::Io(message) => write!(f, "snapshot io: {message}"),
            CheckpointError::ProgramMismatch { expected, found } => write!(
                f,
                "snapshot belongs to program {found}, loaded program is {expected}"
            ),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err.to_string())
    }
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string(self).map_err(|err| CheckpointError::Serialize(err.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, CheckpointError> {
        serde_json::from_str(text).map_err(|err| CheckpointError::Serialize(err.to_string()))
    }
}

/// Persistence seam for the CHECKPOINT instruction. `save` returns an
/// identifier the backend can later `load_snapshot` from.
pub trait CheckpointSink {
    fn save(&mut self, snapshot: &Snapshot) -> Result<String, CheckpointError>;
}

/// Store snapshots as numbered JSON files in a directory.
pub struct FileBackend {
    dir: PathBuf,
    seq: u64,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, seq: 0 })
    }
}

impl CheckpointSink for FileBackend {
    fn save(&mut self, snapshot: &Snapshot) -> Result<String, CheckpointError> {
        let path = self.dir.join(format!("{:04}.ckpt", self.seq));
        self.seq += 1;
        let mut file = fs::File::create(&path)?;
        file.write_all(snapshot.to_json()?.as_bytes())?;
        tracing::debug!(path = %path.display(), "checkpoint written");
        Ok(path.display().to_string())
    }
}

pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Snapshot, CheckpointError> {
    let text = fs::read_to_string(path)?;
    Snapshot::from_json(&text)
}

#[cfg(test)]
mod tests {
    use super::{CheckpointSink, FileBackend, Snapshot};
    use crate::memory::Memory;
    use num_bigint::BigInt;

    fn sample_snapshot() -> Snapshot {
        let mut memory = Memory::new();
        memory.store(3, BigInt::from(-7));
        Snapshot {
            program_hash: "abc".to_string(),
            ip: 4,
            stack: vec![BigInt::from(1), BigInt::from(-2)],
            memory: memory.image(),
            frames: vec![crate::vm::Frame {
                call_site: 1,
                return_ip: 2,
            }],
        }
    }

    #[test]
    fn snapshot_json_roundtrip() {
        let snapshot = sample_snapshot();
        let json = snapshot.to_json().expect("snapshot should encode");
        let back = Snapshot::from_json(&json).expect("snapshot should decode");
        assert_eq!(back.ip, snapshot.ip);
        assert_eq!(back.stack, snapshot.stack);
        assert_eq!(back.memory, snapshot.memory);
        assert_eq!(back.frames.len(), 1);
    }

    #[test]
    fn file_backend_numbers_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let mut backend = FileBackend::new(dir.path()).expect("backend should create");
        let first = backend
            .save(&sample_snapshot())
            .expect("first save should succeed");
        let second = backend
            .save(&sample_snapshot())
            .expect("second save should succeed");
        assert!(first.ends_with("0000.ckpt"));
        assert!(second.ends_with("0001.ckpt"));
        let loaded = super::load_snapshot(&first).expect("snapshot should load");
        assert_eq!(loaded.ip, 4);
    }
}
