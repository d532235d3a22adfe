//! In-memory file system.
//!
//! A single flat directory of files whose contents live in memory. Files are
//! created with a fixed length and never grow: writes past the end of a file
//! are truncated at the end.
//!
//! Every operation on the file system, including reading and writing through
//! an open [`File`], serializes through one global [`Mutex`].
//!
//! Removing a file only unlinks its name. Handles that are already open keep
//! reading and writing the same contents until they are closed.
//!
//! ## Write denial
//!
//! A handle can deny writes to its file with [`File::deny_write`]. While any
//! handle denies writes, every write to the file writes nothing. The denial is
//! lifted when the handle calls [`File::allow_write`] or is closed. The
//! process layer uses this to protect running executables.

use crate::{KernelError, kernel, spinlock::SpinLock, sync::Mutex};
use std::{collections::BTreeMap, sync::Arc};

/// Maximum length of a file name in bytes.
pub const NAME_MAX: usize = 14;

struct Contents {
    bytes: Vec<u8>,
    deny_write: usize,
}

/// File contents shared by every handle opened on it.
struct Inode {
    contents: SpinLock<Contents>,
}

impl Inode {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            contents: SpinLock::new(Contents {
                bytes,
                deny_write: 0,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Contents) -> R) -> R {
        let mut contents = self.contents.lock();
        let r = f(&mut contents);
        contents.unlock();
        r
    }
}

#[derive(Default)]
struct Directory {
    files: BTreeMap<String, Arc<Inode>>,
}

/// The file system of a kernel.
#[derive(Default)]
pub struct FileSystem {
    root: Mutex<Directory>,
}

impl FileSystem {
    /// Creates an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_name(name: &str) -> Result<(), KernelError> {
        if name.is_empty() {
            Err(KernelError::InvalidArgument)
        } else if name.len() > NAME_MAX {
            Err(KernelError::NameTooLong)
        } else {
            Ok(())
        }
    }

    fn insert(&self, name: &str, bytes: Vec<u8>) -> Result<(), KernelError> {
        Self::check_name(name)?;
        let mut root = self.root.lock();
        let result = if root.files.contains_key(name) {
            Err(KernelError::FileExist)
        } else {
            root.files.insert(name.to_string(), Arc::new(Inode::new(bytes)));
            Ok(())
        };
        root.unlock();
        result
    }

    /// Creates a zero-filled file of `size` bytes.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] for an empty name.
    /// - [`KernelError::NameTooLong`] for a name longer than [`NAME_MAX`].
    /// - [`KernelError::FileExist`] if the name is already taken.
    pub fn create(&self, name: &str, size: usize) -> Result<(), KernelError> {
        self.insert(name, vec![0; size])?;
        log::debug!("fs: created {name} ({size} bytes)");
        Ok(())
    }

    /// Creates a file holding `bytes`.
    ///
    /// Used to load executables and fixtures into the file system.
    pub fn install(&self, name: &str, bytes: &[u8]) -> Result<(), KernelError> {
        self.insert(name, bytes.to_vec())?;
        log::debug!("fs: installed {name} ({} bytes)", bytes.len());
        Ok(())
    }

    /// Unlinks `name`. Open handles on the file keep working.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        let mut root = self.root.lock();
        let removed = root.files.remove(name);
        root.unlock();
        match removed {
            Some(_) => {
                log::debug!("fs: removed {name}");
                Ok(())
            }
            None => Err(KernelError::NoSuchEntry),
        }
    }

    /// Opens `name`, returning a handle positioned at the start of the file.
    pub fn open(&self, name: &str) -> Result<File, KernelError> {
        let root = self.root.lock();
        let inode = root.files.get(name).cloned();
        root.unlock();
        inode
            .map(|inode| File {
                inode,
                pos: 0,
                denied: false,
            })
            .ok_or(KernelError::NoSuchEntry)
    }

    /// Whether a file named `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        let root = self.root.lock();
        let exists = root.files.contains_key(name);
        root.unlock();
        exists
    }

    /// Runs `f` with the file system lock held.
    fn serialized<R>(&self, f: impl FnOnce() -> R) -> R {
        let root = self.root.lock();
        let r = f();
        root.unlock();
        r
    }
}

/// An open file.
///
/// Each handle has its own position. Dropping a handle closes it.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    denied: bool,
}

impl File {
    fn serialized<R>(&self, f: impl FnOnce(&mut Contents) -> R) -> R {
        kernel().fs().serialized(|| self.inode.with(f))
    }

    /// Reads into `buf` from the current position, advancing it.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` when
    /// the end of the file is reached.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let read = self.read_at(buf, self.pos);
        self.pos += read;
        read
    }

    /// Reads into `buf` from offset `ofs`, without touching the position.
    pub fn read_at(&self, buf: &mut [u8], ofs: usize) -> usize {
        self.serialized(|contents| {
            let Some(src) = contents.bytes.get(ofs..) else {
                return 0;
            };
            let len = src.len().min(buf.len());
            buf[..len].copy_from_slice(&src[..len]);
            len
        })
    }

    /// Writes `buf` at the current position, advancing it.
    ///
    /// Returns the number of bytes written: the write stops at the end of the
    /// file, and writes nothing while writes to the file are denied.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let written = self.write_at(buf, self.pos);
        self.pos += written;
        written
    }

    /// Writes `buf` at offset `ofs`, without touching the position.
    pub fn write_at(&self, buf: &[u8], ofs: usize) -> usize {
        self.serialized(|contents| {
            if contents.deny_write > 0 {
                return 0;
            }
            let Some(dst) = contents.bytes.get_mut(ofs..) else {
                return 0;
            };
            let len = dst.len().min(buf.len());
            dst[..len].copy_from_slice(&buf[..len]);
            len
        })
    }

    /// Moves the position to `pos`, which may lie past the end of the file.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Current position.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Length of the file in bytes.
    pub fn length(&self) -> usize {
        self.serialized(|contents| contents.bytes.len())
    }

    /// Opens another independent handle on the same file.
    pub fn reopen(&self) -> File {
        File {
            inode: self.inode.clone(),
            pos: 0,
            denied: false,
        }
    }

    /// Whether `self` and `other` refer to the same file.
    pub fn same_file(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.inode, &other.inode)
    }

    /// Denies writes to the file until this handle allows them again or is
    /// closed.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.serialized(|contents| contents.deny_write += 1);
        }
    }

    /// Lifts the write denial of this handle.
    pub fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.serialized(|contents| contents.deny_write -= 1);
        }
    }

    /// Closes the file.
    pub fn close(mut self) {
        self.allow_write();
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // Handles dropped during a teardown release their denial without the
        // file system lock.
        if self.denied {
            self.denied = false;
            self.inode.with(|contents| contents.deny_write -= 1);
        }
    }
}
