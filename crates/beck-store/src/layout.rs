//! Data file naming and raw file access.
//!
//! Trees live in numbered files `mrk00000.dat`, `mrk00001.dat`, … inside the
//! store directory. Files carry no framing of their own; byte ranges are
//! recovered from the index. Handles are opened fresh per call.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Location of a tree's first byte within the file set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskPosition {
    /// Data file number.
    pub suffix: u32,
    /// Byte offset within the file.
    pub offset: u64,
}

impl DiskPosition {
    /// The start of the very first data file.
    pub const START: Self = Self { suffix: 0, offset: 0 };
}

/// Maps data file suffixes to paths and opens files for read or append.
#[derive(Debug)]
pub(crate) struct FileLayout {
    root: PathBuf,
}

impl FileLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Absolute path of the data file with the given suffix.
    ///
    /// Zero-padded to five digits; wider suffixes keep their natural width.
    pub fn data_file_path(&self, suffix: u32) -> PathBuf {
        self.root.join(format!("mrk{suffix:05}.dat"))
    }

    /// Open the file at `pos` for writing, positioned at `pos.offset`.
    ///
    /// The file is created only when writing from offset zero; appending at
    /// a non-zero offset requires the file to already exist.
    pub fn open_append(&self, pos: &DiskPosition) -> io::Result<File> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(pos.offset == 0)
            .open(self.data_file_path(pos.suffix))?;
        file.seek(SeekFrom::Start(pos.offset))?;
        Ok(file)
    }

    /// Open the file at `pos` read-only, positioned at `pos.offset`.
    pub fn open_read(&self, pos: &DiskPosition) -> io::Result<File> {
        let mut file = File::open(self.data_file_path(pos.suffix))?;
        file.seek(SeekFrom::Start(pos.offset))?;
        Ok(file)
    }

    /// Current size in bytes of the file with the given suffix.
    pub fn file_size(&self, suffix: u32) -> io::Result<u64> {
        Ok(fs::metadata(self.data_file_path(suffix))?.len())
    }

    /// Shrink the file with the given suffix to `len` bytes.
    pub fn truncate(&self, suffix: u32, len: u64) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.data_file_path(suffix))?
            .set_len(len)
    }

    /// Delete the file with the given suffix. Missing files are not an error.
    pub fn remove(&self, suffix: u32) -> io::Result<()> {
        match fs::remove_file(self.data_file_path(suffix)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Enumerate the data files present in the store directory, ascending.
    pub fn data_files(&self) -> io::Result<Vec<(u32, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(suffix) = parse_data_file_name(&name.to_string_lossy()) {
                files.push((suffix, entry.path()));
            }
        }
        files.sort_unstable_by_key(|&(suffix, _)| suffix);
        Ok(files)
    }
}

/// Parse `mrk{suffix}.dat` back into its suffix.
fn parse_data_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("mrk")?.strip_suffix(".dat")?;
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
