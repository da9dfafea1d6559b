//! File-system access used by the file service, and its std-backed implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

/// Bytes reserved for an entry name in a directory listing record (NUL included).
pub const DIR_NAME_FIELD_LEN: usize = 256;

/// Size of one serialized directory entry: name field, inode, name length, type.
pub const DIR_RECORD_LEN: usize = DIR_NAME_FIELD_LEN + 3 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create if absent, write-only, existing content kept.
    Write,
    /// Existing file only, every write lands at the end.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub kind: ObjectKind,
}

/// Entry type, encoded with the `DT_*` values of `<dirent.h>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Unknown,
    Directory,
    File,
    Symlink,
}

impl EntryKind {
    pub fn dt_code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Directory => 4,
            Self::File => 8,
            Self::Symlink => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub inode: u64,
    pub kind: EntryKind,
}

impl DirEntry {
    /// Append the wire record: NUL-padded name, then inode, name length and type as
    /// big-endian u32. Names longer than the field are cut.
    pub fn encode_record(&self, out: &mut Vec<u8>) {
        let name = &self.name[..self.name.len().min(DIR_NAME_FIELD_LEN - 1)];
        let mut field = [0u8; DIR_NAME_FIELD_LEN];
        field[..name.len()].copy_from_slice(name);
        out.extend_from_slice(&field);
        out.extend_from_slice(&(self.inode as u32).to_be_bytes());
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.kind.dt_code().to_be_bytes());
    }
}

/// An open file.
pub trait ObjectFile: Read + Write + Seek + Send {
    fn size(&mut self) -> io::Result<u64>;
}

/// File and directory primitives, keyed by path. Handles close on drop.
pub trait FileSystem: Send {
    type File: ObjectFile;
    type Dir: Iterator<Item = io::Result<DirEntry>>;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Self::File>;
    fn stat(&self, path: &Path) -> io::Result<ObjectStat>;
    fn read_dir(&self, path: &Path) -> io::Result<Self::Dir>;
    fn truncate(&self, path: &Path, len: u64) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// The host file system through `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl ObjectFile for File {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Directory iterator of [`LocalFileSystem`].
pub struct LocalDir(fs::ReadDir);

impl Iterator for LocalDir {
    type Item = io::Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.0.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        let kind = match entry.file_type() {
            Ok(t) if t.is_dir() => EntryKind::Directory,
            Ok(t) if t.is_file() => EntryKind::File,
            Ok(t) if t.is_symlink() => EntryKind::Symlink,
            _ => EntryKind::Unknown,
        };
        Some(Ok(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned().into_bytes(),
            inode: inode_of(&entry),
            kind,
        }))
    }
}

#[cfg(unix)]
fn inode_of(entry: &fs::DirEntry) -> u64 {
    use std::os::unix::fs::DirEntryExt;
    entry.ino()
}

#[cfg(not(unix))]
fn inode_of(_entry: &fs::DirEntry) -> u64 {
    0
}

impl FileSystem for LocalFileSystem {
    type File = File;
    type Dir = LocalDir;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<File> {
        match mode {
            OpenMode::Read => File::open(path),
            OpenMode::Write => OpenOptions::new().write(true).create(true).open(path),
            OpenMode::Append => OpenOptions::new().append(true).open(path),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<ObjectStat> {
        let meta = fs::metadata(path)?;
        let kind = if meta.is_dir() {
            ObjectKind::Directory
        } else if meta.is_file() {
            ObjectKind::File
        } else {
            ObjectKind::Other
        };
        Ok(ObjectStat { kind })
    }

    fn read_dir(&self, path: &Path) -> io::Result<LocalDir> {
        Ok(LocalDir(fs::read_dir(path)?))
    }

    fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
        OpenOptions::new().write(true).open(path)?.set_len(len)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to).map(|_| ())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}
