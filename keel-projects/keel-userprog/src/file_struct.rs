//! Open files of a process.
//!
//! Descriptors 0 and 1 are the console's input and output. Every file the
//! process opens gets the lowest free descriptor from 2 on; a closed
//! descriptor is reused by the next open.

use keel::{
    KernelError,
    fs::File,
    kernel,
    teletype::{Console, Teletype},
};
use std::collections::BTreeMap;

/// A file descriptor.
pub type FileDescriptor = i32;

/// Descriptor of the console input.
pub const STDIN: FileDescriptor = 0;
/// Descriptor of the console output.
pub const STDOUT: FileDescriptor = 1;
/// Most descriptors a process may hold, the standard ones included.
pub const MAX_OPEN_FILES: usize = 128;

/// What a descriptor refers to.
pub enum FileKind {
    Stdin,
    Stdout,
    Regular(File),
}

/// The descriptor table of a process.
pub struct FileStruct {
    files: BTreeMap<FileDescriptor, FileKind>,
}

impl Default for FileStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStruct {
    /// Creates a table holding the standard descriptors.
    pub fn new() -> Self {
        let mut files = BTreeMap::new();
        files.insert(STDIN, FileKind::Stdin);
        files.insert(STDOUT, FileKind::Stdout);
        Self { files }
    }

    /// Installs `file` under the lowest free descriptor.
    pub fn install(&mut self, file: File) -> Result<FileDescriptor, KernelError> {
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(KernelError::TooManyOpenFile);
        }
        let fd = (2..)
            .find(|fd| !self.files.contains_key(fd))
            .ok_or(KernelError::TooManyOpenFile)?;
        self.files.insert(fd, FileKind::Regular(file));
        Ok(fd)
    }

    /// Opens `name` and installs it.
    pub fn open(&mut self, name: &str) -> Result<FileDescriptor, KernelError> {
        let file = kernel().fs().open(name)?;
        self.install(file)
    }

    pub fn get(&mut self, fd: FileDescriptor) -> Result<&mut FileKind, KernelError> {
        self.files.get_mut(&fd).ok_or(KernelError::BadFileDescriptor)
    }

    fn regular(&mut self, fd: FileDescriptor) -> Result<&mut File, KernelError> {
        match self.get(fd)? {
            FileKind::Regular(file) => Ok(file),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Reads from `fd` into `buf`.
    ///
    /// The console input yields whatever has been typed, possibly nothing.
    pub fn read(&mut self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
        match self.get(fd)? {
            FileKind::Stdin => Console::new().read(buf),
            FileKind::Stdout => Err(KernelError::InvalidArgument),
            FileKind::Regular(file) => Ok(file.read(buf)),
        }
    }

    /// Writes `data` to `fd`.
    ///
    /// Writes to a file stop at its end; writes to an executable in use
    /// write nothing.
    pub fn write(&mut self, fd: FileDescriptor, data: &[u8]) -> Result<usize, KernelError> {
        match self.get(fd)? {
            FileKind::Stdin => Err(KernelError::InvalidArgument),
            FileKind::Stdout => Console::new().write(data),
            FileKind::Regular(file) => Ok(file.write(data)),
        }
    }

    pub fn filesize(&mut self, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.regular(fd).map(|file| file.length())
    }

    pub fn seek(&mut self, fd: FileDescriptor, pos: usize) -> Result<(), KernelError> {
        self.regular(fd).map(|file| file.seek(pos))
    }

    pub fn tell(&mut self, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.regular(fd).map(|file| file.tell())
    }

    /// A handle on the file behind `fd`, independent of the descriptor.
    pub fn reopen(&mut self, fd: FileDescriptor) -> Result<File, KernelError> {
        self.regular(fd).map(|file| file.reopen())
    }

    /// Closes `fd`. The console descriptors cannot be closed.
    pub fn close(&mut self, fd: FileDescriptor) -> Result<(), KernelError> {
        match self.files.get(&fd) {
            None => Err(KernelError::BadFileDescriptor),
            Some(FileKind::Stdin | FileKind::Stdout) => Err(KernelError::InvalidArgument),
            Some(FileKind::Regular(_)) => {
                if let Some(FileKind::Regular(file)) = self.files.remove(&fd) {
                    file.close();
                }
                Ok(())
            }
        }
    }

    /// Closes every descriptor.
    pub fn close_all(&mut self) {
        for (_, kind) in std::mem::take(&mut self.files) {
            if let FileKind::Regular(file) = kind {
                file.close();
            }
        }
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
