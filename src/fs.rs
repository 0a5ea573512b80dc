//! Contract of the file system and file-descriptor layer.

use core::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    Resolve,
    OutOfFile,
}

impl Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::Resolve => write!(f, "path does not resolve"),
            FsError::OutOfFile => write!(f, "file table full"),
        }
    }
}

/// Counted reference to an in-memory inode.
#[derive(Debug, PartialEq, Eq)]
pub struct Inode(usize);

impl Inode {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Counted reference to an open file.
#[derive(Debug, PartialEq, Eq)]
pub struct File(usize);

impl File {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Operations consumed from the storage layer.
pub trait Storage: Sync {
    /// Resolves `path` to an inode reference.
    fn namei(&self, path: &str) -> Result<Inode, FsError>;

    /// Takes another reference to `inode`.
    fn idup(&self, inode: &Inode) -> Inode;

    /// Drops a reference to `inode`. Must be called inside an [`Operation`].
    fn iput(&self, inode: Inode);

    /// Opens `path` as a file.
    fn open(&self, path: &str) -> Result<File, FsError>;

    /// Takes another reference to `file`.
    fn filedup(&self, file: &File) -> File;

    /// Drops a reference to `file`.
    fn fileclose(&self, file: File);

    fn begin_op(&self);

    fn end_op(&self);
}

/// A file system transaction, ended when dropped.
pub struct Operation<'a> {
    fs: &'a dyn Storage,
}

impl<'a> Operation<'a> {
    pub fn begin(fs: &'a dyn Storage) -> Self {
        fs.begin_op();
        Self { fs }
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        self.fs.end_op();
    }
}
