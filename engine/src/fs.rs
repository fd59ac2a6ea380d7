//! FileSystem backend: owns the data directory, the mapping file, chunk files,
//! and the append-only operation log. The engine never touches these files
//! directly -- it only calls through here.
//!
//! Mapping and chunk files are line-delimited JSON, written via a
//! temp-file-then-rename for atomicity, the same pattern a log-structured
//! store's `compact()` uses.

use crate::error::{EngineError, Result};
use crate::model::{Key, KeyIndex, ReverseIndex, ResidentMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MAPPING_FILE: &str = "mapping";
const OPLOG_FILE: &str = "oplog";
const CHUNK_PREFIX: &str = "chunk-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Delete,
}

#[derive(Serialize, Deserialize)]
struct MappingRecord {
    row: String,
    col: String,
    chunk_id: String,
}

#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    row: String,
    col: String,
    value: String,
}

#[derive(Serialize, Deserialize)]
struct LogRecord {
    kind: OpKind,
    chunk_id: String,
    row: String,
    col: String,
    value: String,
}

/// Callback invoked once per OpLog record during replay, in append order.
pub trait OpApplier {
    fn apply(&mut self, kind: OpKind, chunk_id: &str, key: &Key, value: &str) -> Result<()>;
}

pub struct FileSystem {
    data_dir: PathBuf,
    next_chunk_id: u64,
}

impl FileSystem {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut next_chunk_id = 0u64;
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(suffix) = name.strip_prefix(CHUNK_PREFIX) {
                    if let Ok(n) = suffix.parse::<u64>() {
                        next_chunk_id = next_chunk_id.max(n + 1);
                    }
                }
            }
        }

        Ok(FileSystem {
            data_dir,
            next_chunk_id,
        })
    }

    fn mapping_path(&self) -> PathBuf {
        self.data_dir.join(MAPPING_FILE)
    }

    fn oplog_path(&self) -> PathBuf {
        self.data_dir.join(OPLOG_FILE)
    }

    fn chunk_path(&self, chunk_id: &str) -> PathBuf {
        self.data_dir.join(chunk_id)
    }

    /// Allocates a fresh, previously unused chunk-id.
    pub fn place_new_entry(&mut self) -> Result<String> {
        let id = format!("{CHUNK_PREFIX}{}", self.next_chunk_id);
        self.next_chunk_id += 1;
        Ok(id)
    }

    /// Reads the persistent mapping file and populates KeyIndex + ReverseIndex.
    pub fn get_mappings(&self) -> Result<(KeyIndex, ReverseIndex)> {
        let path = self.mapping_path();
        let mut index = KeyIndex::new();

        if path.exists() {
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: MappingRecord = serde_json::from_str(&line)?;
                index.insert(Key::new(record.row, record.col), record.chunk_id);
            }
        }

        let reverse = crate::model::invert(&index);
        Ok((index, reverse))
    }

    /// Overwrites the mapping file with the full contents of `index`.
    pub fn write_mapping(&self, index: &KeyIndex) -> Result<()> {
        let mut lines = Vec::with_capacity(index.len());
        for (key, chunk_id) in index {
            let record = MappingRecord {
                row: key.row.clone(),
                col: key.col.clone(),
                chunk_id: chunk_id.clone(),
            };
            lines.push(serde_json::to_string(&record)?);
        }
        self.atomic_write(&self.mapping_path(), &lines)
    }

    /// Reads a chunk file and merges its cells into `out`, never replacing
    /// cells belonging to other chunks.
    pub fn read_file(&self, chunk_id: &str, out: &mut ResidentMap) -> Result<()> {
        let path = self.chunk_path(chunk_id);
        if !path.exists() {
            return Ok(());
        }
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ChunkRecord = serde_json::from_str(&line)?;
            crate::model::resident_put(out, &Key::new(record.row, record.col), record.value);
        }
        Ok(())
    }

    /// Overwrites a chunk file with exactly the given cells.
    pub fn write_chunk(&self, chunk_id: &str, cells: &HashMap<Key, String>) -> Result<()> {
        let mut lines = Vec::with_capacity(cells.len());
        for (key, value) in cells {
            let record = ChunkRecord {
                row: key.row.clone(),
                col: key.col.clone(),
                value: value.clone(),
            };
            lines.push(serde_json::to_string(&record)?);
        }
        self.atomic_write(&self.chunk_path(chunk_id), &lines)
    }

    /// Deletes a chunk file that has become empty.
    pub fn remove_chunk(&self, chunk_id: &str) -> Result<()> {
        let path = self.chunk_path(chunk_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Synchronously appends a single record to the OpLog.
    pub fn write_log(&self, chunk_id: &str, key: &Key, value: &str, kind: OpKind) -> Result<()> {
        let record = LogRecord {
            kind,
            chunk_id: chunk_id.to_string(),
            row: key.row.clone(),
            col: key.col.clone(),
            value: value.to_string(),
        };
        let line = serde_json::to_string(&record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.oplog_path())?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    /// Truncates the OpLog. Only ever called after a snapshot has durably
    /// written the mapping and all dirty chunks.
    pub fn clear_temp_log(&self) -> Result<()> {
        File::create(self.oplog_path())?;
        Ok(())
    }

    /// Reads OpLog entries in append order, invoking `applier.apply` for
    /// each. A trailing line that fails to parse is a partial write from a
    /// crash mid-append and is silently discarded; a failure anywhere else is
    /// corruption and fails loudly.
    pub fn replay(&self, applier: &mut dyn OpApplier) -> Result<()> {
        let path = self.oplog_path();
        if !path.exists() {
            return Ok(());
        }
        let file = File::open(&path)?;
        let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;

        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => {
                    let key = Key::new(record.row, record.col);
                    applier.apply(record.kind, &record.chunk_id, &key, &record.value)?;
                }
                Err(err) => {
                    if i == lines.len() - 1 {
                        break;
                    }
                    return Err(EngineError::Corrupt(format!(
                        "unparseable oplog record at line {i}: {err}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn atomic_write(&self, path: &Path, lines: &[String]) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for line in lines {
                writeln!(tmp, "{line}")?;
            }
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn place_new_entry_is_unique_within_lifetime() {
        let dir = tempdir().unwrap();
        let mut fs = FileSystem::open(dir.path()).unwrap();
        let a = fs.place_new_entry().unwrap();
        let b = fs.place_new_entry().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn place_new_entry_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let mut fs = FileSystem::open(dir.path()).unwrap();
        let first = fs.place_new_entry().unwrap();
        fs.write_chunk(&first, &HashMap::new()).unwrap();
        drop(fs);

        let mut fs2 = FileSystem::open(dir.path()).unwrap();
        let second = fs2.place_new_entry().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn mapping_roundtrips() {
        let dir = tempdir().unwrap();
        let fs = FileSystem::open(dir.path()).unwrap();
        let mut index = KeyIndex::new();
        index.insert(Key::new("a", "x"), "chunk-0".to_string());
        fs.write_mapping(&index).unwrap();

        let (loaded, reverse) = fs.get_mappings().unwrap();
        assert_eq!(loaded, index);
        assert_eq!(reverse["chunk-0"].len(), 1);
    }

    #[test]
    fn chunk_roundtrips() {
        let dir = tempdir().unwrap();
        let fs = FileSystem::open(dir.path()).unwrap();
        let mut cells = HashMap::new();
        cells.insert(Key::new("a", "x"), "1".to_string());
        fs.write_chunk("chunk-0", &cells).unwrap();

        let mut out = ResidentMap::new();
        fs.read_file("chunk-0", &mut out).unwrap();
        assert_eq!(out["a"]["x"], "1");
    }

    #[test]
    fn replay_discards_partial_trailing_record() {
        let dir = tempdir().unwrap();
        let fs = FileSystem::open(dir.path()).unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(fs.oplog_path())
            .unwrap();
        writeln!(
            file,
            r#"{{"kind":"Put","chunk_id":"chunk-0","row":"a","col":"x","value":"1"}}"#
        )
        .unwrap();
        write!(file, r#"{{"kind":"Put","chunk_id":"chunk-0","row":"a""#).unwrap();
        drop(file);

        struct Collector(Vec<(OpKind, String, Key, String)>);
        impl OpApplier for Collector {
            fn apply(&mut self, kind: OpKind, chunk_id: &str, key: &Key, value: &str) -> Result<()> {
                self.0
                    .push((kind, chunk_id.to_string(), key.clone(), value.to_string()));
                Ok(())
            }
        }

        let mut collector = Collector(Vec::new());
        fs.replay(&mut collector).unwrap();
        assert_eq!(collector.0.len(), 1);
    }
}
