use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use polars::prelude::*;
use polars_io::ipc::{IpcCompression, IpcWriter};
use polars_io::SerWriter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clustering::PartStats;
use crate::error::{LakeError, LakeResult};
use crate::schema::TableSchema;
use crate::engine::CommitInfo;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Parquet,
    Ipc,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Parquet => "parquet",
            Format::Ipc => "arrow",
        }
    }
}

impl FromStr for Format {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parquet" => Ok(Format::Parquet),
            "ipc" | "arrow" => Ok(Format::Ipc),
            other => Err(LakeError::InvalidArgument(format!("unknown storage format {other:?}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Snappy,
    Zstd,
    Lz4,
}

impl FromStr for Compression {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snappy" => Ok(Compression::Snappy),
            "zstd" => Ok(Compression::Zstd),
            "lz4" => Ok(Compression::Lz4),
            other => Err(LakeError::InvalidArgument(format!("unknown compression {other:?}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatasetStorage {
    pub root: PathBuf, // Table directory
    pub format: Format,
    pub compression: Option<Compression>,
}

impl DatasetStorage {
    pub fn new(root: PathBuf, format: Format, compression: Option<Compression>) -> LakeResult<Self> {
        if format == Format::Ipc && compression == Some(Compression::Snappy) {
            return Err(LakeError::InvalidArgument("snappy compression is only available for parquet".to_string()));
        }
        Ok(Self { root, format, compression })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// `commit_id` keeps files of competing commits for the same version apart.
    pub fn part_file_name(&self, version: u64, commit_id: u32, index: usize) -> String {
        format!("part-{:0>6}-{:08x}-{:0>5}.{}", version, commit_id, index, self.format.extension())
    }

    pub fn write_part(&self, file: &str, df: &mut DataFrame) -> LakeResult<()> {
        let path = self.root.join(file);
        let mut out = std::io::BufWriter::new(fs::File::create(&path)?);
        match self.format {
            Format::Parquet => {
                let compression = match self.compression {
                    Some(Compression::Snappy) => ParquetCompression::Snappy,
                    Some(Compression::Zstd) => ParquetCompression::Zstd(None),
                    Some(Compression::Lz4) => ParquetCompression::Lz4Raw,
                    None => ParquetCompression::Uncompressed,
                };
                ParquetWriter::new(&mut out).with_compression(compression).finish(df)?;
            },
            Format::Ipc => {
                let compression = match self.compression {
                    Some(Compression::Zstd) => Some(IpcCompression::ZSTD),
                    Some(Compression::Lz4) => Some(IpcCompression::LZ4),
                    _ => None,
                };
                IpcWriter::new(&mut out).with_compression(compression).finish(df)?;
            },
        }
        debug!(path = %path.display(), rows = df.height(), "wrote part");
        Ok(())
    }

    /// Lazy scan of one part file, so skipped parts are never read.
    pub fn scan_part(&self, file: &str) -> LakeResult<LazyFrame> {
        let path = self.root.join(file);
        if !path.is_file() {
            return Err(LakeError::Storage(format!("missing part file {}", path.display())));
        }
        let lf = match self.format {
            Format::Parquet => LazyFrame::scan_parquet(&path, ScanArgsParquet::default())?,
            Format::Ipc => LazyFrame::scan_ipc(&path, ScanArgsIpc::default())?,
        };
        Ok(lf)
    }

    /// Replaces the manifest through a rename so readers never see a torn file.
    pub fn write_manifest(&self, manifest: &Manifest) -> LakeResult<()> {
        let tmp = self.root.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(manifest)?)?;
        fs::rename(&tmp, self.manifest_path())?;
        Ok(())
    }

    pub fn read_manifest(root: &Path) -> LakeResult<Option<Manifest>> {
        let path = root.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str::<Manifest>(&contents)?))
    }

    /// Deletes part files the manifest no longer lists.
    pub fn remove_unreferenced(&self, manifest: &Manifest) -> LakeResult<usize> {
        let ext = format!(".{}", self.format.extension());
        let mut files = Vec::new();
        extract_files(&self.root, &ext, &mut files)?;
        let mut removed = 0;
        for file in files {
            let referenced = file.file_name()
                .and_then(|n| n.to_str())
                .map(|n| manifest.parts.iter().any(|p| p.file == n))
                .unwrap_or(false);
            if !referenced {
                fs::remove_file(&file)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartEntry {
    pub file: String,
    pub rows: usize,
    pub stats: PartStats,
}

/// On-disk description of one table version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub schema: TableSchema,
    pub cluster_columns: Vec<String>,
    pub version: u64,
    pub storage: DatasetStorage,
    pub parts: Vec<PartEntry>,
    pub history: Vec<CommitInfo>,
}

pub fn extract_files<'a>(dir: &Path, contains: &str, files: &'a mut Vec<PathBuf>) -> LakeResult<&'a mut Vec<PathBuf>> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                extract_files(&path, contains, files)?;
            } else if path.to_string_lossy().contains(contains) {
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options() -> LakeResult<()> {
        assert_eq!("PARQUET".parse::<Format>()?, Format::Parquet);
        assert_eq!("arrow".parse::<Format>()?, Format::Ipc);
        assert_eq!("zstd".parse::<Compression>()?, Compression::Zstd);
        assert!("csv".parse::<Format>().is_err());
        assert!(DatasetStorage::new(PathBuf::from("x"), Format::Ipc, Some(Compression::Snappy)).is_err());
        Ok(())
    }

    #[test]
    fn part_files_round_trip_in_both_formats() -> LakeResult<()> {
        let dir = tempfile::tempdir()?;
        for (format, compression) in [(Format::Parquet, Some(Compression::Snappy)), (Format::Ipc, Some(Compression::Zstd))] {
            let storage = DatasetStorage::new(dir.path().to_path_buf(), format, compression)?;
            let mut df = df! { "id" => &[1i32, 2, 3], "category" => &["a", "b", "c"] }?;
            let file = storage.part_file_name(1, 7, 0);
            storage.write_part(&file, &mut df)?;
            assert!(storage.scan_part(&file)?.collect()?.frame_equal(&df));
        }
        Ok(())
    }

    #[test]
    fn cleanup_keeps_referenced_parts() -> LakeResult<()> {
        let dir = tempfile::tempdir()?;
        let storage = DatasetStorage::new(dir.path().to_path_buf(), Format::Parquet, None)?;
        let mut df = df! { "id" => &[1i32] }?;
        let old = storage.part_file_name(0, 1, 0);
        let new = storage.part_file_name(1, 7, 0);
        storage.write_part(&old, &mut df)?;
        storage.write_part(&new, &mut df)?;

        let manifest = Manifest {
            schema: TableSchema::new(vec![crate::schema::ColumnDef::new("id", crate::schema::ColumnType::Int)])?,
            cluster_columns: Vec::new(),
            version: 1,
            storage: storage.clone(),
            parts: vec![PartEntry { file: new.clone(), rows: 1, stats: PartStats::new() }],
            history: Vec::new(),
        };
        storage.write_manifest(&manifest)?;
        assert_eq!(storage.remove_unreferenced(&manifest)?, 1);
        assert!(!dir.path().join(&old).exists());
        assert!(dir.path().join(&new).exists());
        assert_eq!(DatasetStorage::read_manifest(dir.path())?, Some(manifest));
        Ok(())
    }
}
