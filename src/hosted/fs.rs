use std::collections::BTreeMap;
use std::string::String;
use std::vec::Vec;

use spin::Mutex;

use crate::fs::{File, FsError, Inode, Storage};

/// Inode number of `/`.
pub const ROOT_INODE: usize = 1;

/// Most files open at once, machine-wide.
pub const NFILE: usize = 100;

#[derive(Default)]
struct State {
    /// Path to inode number.
    names: BTreeMap<String, usize>,
    /// Inode number to reference count.
    inodes: BTreeMap<usize, usize>,
    /// Open file to (inode, reference count).
    files: BTreeMap<usize, (usize, usize)>,
    next_file: usize,
    /// Open transactions.
    depth: usize,
}

/// A flat, in-memory namespace with counted inode and file references.
pub struct HostFs {
    state: Mutex<State>,
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new(&["console"])
    }
}

impl HostFs {
    /// A file system holding `/` and the given files under it.
    pub fn new(files: &[&str]) -> Self {
        let mut state = State::default();
        state.names.insert(String::from("/"), ROOT_INODE);
        for (i, name) in files.iter().enumerate() {
            let path = String::from("/") + name.trim_start_matches('/');
            state.names.insert(path, ROOT_INODE + 1 + i);
        }

        Self {
            state: Mutex::new(state),
        }
    }

    /// References held on inode `inum`.
    pub fn inode_refs(&self, inum: usize) -> usize {
        self.state.lock().inodes.get(&inum).copied().unwrap_or(0)
    }

    /// Open files, each counted once however many descriptors share it.
    pub fn open_files(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Number of transactions still open.
    pub fn transactions(&self) -> usize {
        self.state.lock().depth
    }

    fn resolve(state: &State, path: &str) -> Result<usize, FsError> {
        let path = if path.starts_with('/') {
            String::from(path)
        } else {
            String::from("/") + path
        };
        state.names.get(&path).copied().ok_or(FsError::Resolve)
    }
}

impl Storage for HostFs {
    fn namei(&self, path: &str) -> Result<Inode, FsError> {
        let mut state = self.state.lock();
        let inum = Self::resolve(&state, path)?;
        *state.inodes.entry(inum).or_insert(0) += 1;
        Ok(Inode::from_raw(inum))
    }

    fn idup(&self, inode: &Inode) -> Inode {
        let mut state = self.state.lock();
        let refs = state
            .inodes
            .get_mut(&inode.as_raw())
            .expect("idup of an unreferenced inode");
        *refs += 1;
        Inode::from_raw(inode.as_raw())
    }

    fn iput(&self, inode: Inode) {
        let mut state = self.state.lock();
        assert!(state.depth > 0, "iput outside a transaction");

        let inum = inode.as_raw();
        let refs = state.inodes.get_mut(&inum).expect("iput of an unreferenced inode");
        *refs -= 1;
        if *refs == 0 {
            state.inodes.remove(&inum);
        }
    }

    fn open(&self, path: &str) -> Result<File, FsError> {
        let mut state = self.state.lock();
        let inum = Self::resolve(&state, path)?;
        if state.files.len() >= NFILE {
            return Err(FsError::OutOfFile);
        }

        state.next_file += 1;
        let id = state.next_file;
        state.files.insert(id, (inum, 1));
        Ok(File::from_raw(id))
    }

    fn filedup(&self, file: &File) -> File {
        let mut state = self.state.lock();
        let (_, refs) = state
            .files
            .get_mut(&file.as_raw())
            .expect("filedup of a closed file");
        *refs += 1;
        File::from_raw(file.as_raw())
    }

    fn fileclose(&self, file: File) {
        let mut state = self.state.lock();
        let id = file.as_raw();
        let (_, refs) = state.files.get_mut(&id).expect("fileclose of a closed file");
        *refs -= 1;
        if *refs == 0 {
            state.files.remove(&id);
        }
    }

    fn begin_op(&self) {
        self.state.lock().depth += 1;
    }

    fn end_op(&self) {
        let mut state = self.state.lock();
        assert!(state.depth > 0, "end_op without begin_op");
        state.depth -= 1;
    }
}

/// Names under `/`, sorted.
impl core::fmt::Debug for HostFs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<String> = self.state.lock().names.keys().cloned().collect();
        f.debug_struct("HostFs").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Operation;

    #[test]
    fn references_are_counted() {
        let fs = HostFs::default();
        let root = fs.namei("/").unwrap();
        let again = fs.idup(&root);
        assert_eq!(fs.inode_refs(ROOT_INODE), 2);

        {
            let _op = Operation::begin(&fs);
            fs.iput(root);
            fs.iput(again);
        }
        assert_eq!(fs.inode_refs(ROOT_INODE), 0);
        assert_eq!(fs.transactions(), 0);
        assert_eq!(fs.namei("missing"), Err(FsError::Resolve));
    }

    #[test]
    fn files_close_on_last_reference() {
        let fs = HostFs::default();
        let file = fs.open("console").unwrap();
        let dup = fs.filedup(&file);
        fs.fileclose(file);
        assert_eq!(fs.open_files(), 1);
        fs.fileclose(dup);
        assert_eq!(fs.open_files(), 0);
    }

    #[test]
    #[should_panic(expected = "iput outside a transaction")]
    fn iput_needs_a_transaction() {
        let fs = HostFs::default();
        let root = fs.namei("/").unwrap();
        fs.iput(root);
    }
}
