//! Versioned multi-dataset container
//!
//! Layout, integers little-endian:
//!
//! ```text
//! magic    [u8; 4]   "NNDS"
//! version  u32
//! count    u32
//! count x  { length u64, record [u8; length] }
//! ```
//!
//! Each record is a bincode-encoded [`DatasetSnapshot`]. The descriptor at the
//! front of every record is decoded and validated when the archive is opened,
//! so listing an archive never touches payload bytes. A record whose
//! descriptor declares more payload than the record holds is rejected before
//! anything is allocated for it.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use nn_data_core::{
    restore_dataset, DataSet, DatasetConfig, DatasetDescriptor, DatasetSnapshot, DeviceMemory,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Leading bytes of every archive
pub const ARCHIVE_MAGIC: [u8; 4] = *b"NNDS";

/// Current format version
pub const ARCHIVE_VERSION: u32 = 1;

const HEADER_LEN: usize = 12;

/// One stored dataset
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    /// Shape, type and attributes of the stored dataset
    pub descriptor: DatasetDescriptor,
    record: Range<usize>,
}

impl ArchiveEntry {
    /// Dataset name
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Encoded record size in bytes
    pub fn record_len(&self) -> usize {
        self.record.len()
    }
}

/// Memory-mapped dataset archive
#[derive(Debug)]
pub struct DatasetArchive {
    path: PathBuf,
    mmap: Mmap,
    entries: Vec<ArchiveEntry>,
}

impl DatasetArchive {
    /// Write `datasets` to `path`, replacing any existing file
    pub fn write<P: AsRef<Path>>(path: P, datasets: &[&dyn DataSet]) -> Result<()> {
        let snapshots = datasets
            .iter()
            .map(|dataset| dataset.snapshot())
            .collect::<nn_data_core::Result<Vec<_>>>()?;
        Self::write_snapshots(path, &snapshots)
    }

    /// Write already exported snapshots to `path`
    pub fn write_snapshots<P: AsRef<Path>>(path: P, snapshots: &[DatasetSnapshot]) -> Result<()> {
        let path = path.as_ref();
        let mut names = HashSet::new();
        if let Some(duplicate) = snapshots
            .iter()
            .map(|snapshot| snapshot.descriptor.name.as_str())
            .find(|&name| !names.insert(name))
        {
            return Err(Error::Format(format!("dataset {duplicate} appears twice")));
        }
        let count = u32::try_from(snapshots.len())
            .map_err(|_| Error::Format(format!("{} datasets exceed the record count", snapshots.len())))?;

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&ARCHIVE_MAGIC)?;
        writer.write_all(&ARCHIVE_VERSION.to_le_bytes())?;
        writer.write_all(&count.to_le_bytes())?;
        for snapshot in snapshots {
            let record = bincode::serialize(snapshot)?;
            writer.write_all(&(record.len() as u64).to_le_bytes())?;
            writer.write_all(&record)?;
            debug!(dataset = %snapshot.descriptor.name, bytes = record.len(), "wrote record");
        }
        writer.flush()?;

        info!(path = %path.display(), datasets = snapshots.len(), "wrote dataset archive");
        Ok(())
    }

    /// Map `path` and index its records
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: the map is read-only and archives are not rewritten while open
        #[allow(unsafe_code)]
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let entries = index_records(&mmap)?;
        info!(path = %path.display(), datasets = entries.len(), "opened dataset archive");
        Ok(Self { path, mmap, entries })
    }

    /// Open `path` and restore every dataset, charging all of them to `memory`
    pub fn read<P: AsRef<Path>>(
        path: P,
        config: DatasetConfig,
        memory: &Arc<DeviceMemory>,
    ) -> Result<Vec<Box<dyn DataSet>>> {
        Self::open(path)?.load_all(config, memory)
    }

    /// Archive location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored datasets in file order
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Number of stored datasets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive holds no datasets
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode the record of dataset `name`
    pub fn snapshot(&self, name: &str) -> Result<DatasetSnapshot> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name() == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.decode(entry)
    }

    fn decode(&self, entry: &ArchiveEntry) -> Result<DatasetSnapshot> {
        Ok(bincode::deserialize(&self.mmap[entry.record.clone()])?)
    }

    /// Restore dataset `name`
    pub fn load(
        &self,
        name: &str,
        config: DatasetConfig,
        memory: Arc<DeviceMemory>,
    ) -> Result<Box<dyn DataSet>> {
        let snapshot = self.snapshot(name)?;
        Ok(restore_dataset(&snapshot, config, memory)?)
    }

    /// Restore every dataset, charging all of them to `memory`
    pub fn load_all(
        &self,
        config: DatasetConfig,
        memory: &Arc<DeviceMemory>,
    ) -> Result<Vec<Box<dyn DataSet>>> {
        self.entries
            .iter()
            .map(|entry| {
                let snapshot = self.decode(entry)?;
                Ok(restore_dataset(&snapshot, config, Arc::clone(memory))?)
            })
            .collect()
    }
}

fn index_records(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    if bytes.len() < HEADER_LEN || bytes[..4] != ARCHIVE_MAGIC {
        return Err(Error::Format("not a dataset archive".into()));
    }
    let version = read_u32(bytes, 4)?;
    if version != ARCHIVE_VERSION {
        return Err(Error::Format(format!(
            "archive version {version}, expected {ARCHIVE_VERSION}"
        )));
    }
    let count = read_u32(bytes, 8)? as usize;

    let mut entries = Vec::new();
    let mut offset = HEADER_LEN;
    for record in 0..count {
        let length = usize::try_from(read_u64(bytes, offset)?)
            .map_err(|_| Error::Format(format!("record {record} length overflows")))?;
        let start = offset + 8;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Error::Format(format!("record {record} is truncated")))?;
        let descriptor: DatasetDescriptor = bincode::deserialize(&bytes[start..end])?;
        descriptor.validate()?;
        if descriptor.payload_bytes().map_or(true, |payload| payload > length) {
            return Err(Error::Format(format!(
                "record {record} ({}) declares more payload than its {length} bytes",
                descriptor.name
            )));
        }
        entries.push(ArchiveEntry {
            descriptor,
            record: start..end,
        });
        offset = end;
    }
    if offset != bytes.len() {
        return Err(Error::Format(format!(
            "{} trailing bytes after {count} records",
            bytes.len() - offset
        )));
    }
    Ok(entries)
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::Format(format!("truncated at byte {offset}")))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| Error::Format(format!("truncated at byte {offset}")))
}
