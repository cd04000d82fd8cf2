//! The build graph as the hash log consumes it: files, the builds that
//! produce them, and the per-file stat state gathered during a run.

use crate::densemap::{self, DenseMap};
use crate::fs::{FileStat, FileSystem};
use hashbrown::HashMap;

/// Id for File nodes, dense for the lifetime of one graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileId(usize);
impl From<usize> for FileId {
    fn from(u: usize) -> FileId {
        FileId(u)
    }
}
impl densemap::Index for FileId {
    fn index(&self) -> usize {
        self.0
    }
}

/// Id for Build nodes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BuildId(usize);
impl From<usize> for BuildId {
    fn from(u: usize) -> BuildId {
        BuildId(u)
    }
}
impl densemap::Index for BuildId {
    fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct File {
    pub name: String,
    /// The build that generates this file, if any.
    pub input: Option<BuildId>,
}

/// A single build rule: a command that consumes inputs and produces outputs.
/// Only the parts the hash log needs are modeled here.
#[derive(Debug)]
pub struct Build {
    /// Input files, with the order-only suffix last.
    pub ins: Vec<FileId>,
    /// Number of trailing entries in `ins` that are order-only: they must
    /// exist before the build runs but their content doesn't affect it.
    pub order_only: usize,
    pub outs: Vec<FileId>,
    /// Whether outputs of this build should be checked by content hash.
    pub hash_input: bool,
}

impl Build {
    /// Inputs whose content affects the output, i.e. all but order-only.
    pub fn dirtying_ins(&self) -> &[FileId] {
        &self.ins[..self.ins.len() - self.order_only]
    }
}

#[derive(Default)]
pub struct Graph {
    files: DenseMap<FileId, File>,
    file_ids: HashMap<String, FileId>,
    builds: DenseMap<BuildId, Build>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Look up a file by name, adding it if not already present.
    pub fn file_id(&mut self, name: &str) -> FileId {
        match self.file_ids.get(name) {
            Some(&id) => id,
            None => {
                let id = self.files.push(File {
                    name: name.to_owned(),
                    input: None,
                });
                self.file_ids.insert(name.to_owned(), id);
                id
            }
        }
    }

    pub fn file(&self, id: FileId) -> &File {
        self.files.get(id)
    }

    pub fn add_build(&mut self, build: Build) -> BuildId {
        let id = self.builds.next_id();
        for &out in &build.outs {
            let f = self.files.get_mut(out);
            match f.input {
                Some(b) => panic!("double link {:?}", b),
                None => f.input = Some(id),
            }
        }
        self.builds.push(build)
    }

    pub fn build(&self, id: BuildId) -> &Build {
        self.builds.get(id)
    }
}

/// stat() results for the files in a Graph, gathered over one run.
/// A file the build has not stat()ed yet has no entry.
pub struct FileState(DenseMap<FileId, Option<FileStat>>);

impl FileState {
    pub fn new() -> Self {
        FileState(DenseMap::new())
    }

    pub fn get(&self, id: FileId) -> Option<FileStat> {
        self.0.lookup(id).copied().flatten()
    }

    /// stat() a file and remember the result.
    pub fn stat(
        &mut self,
        graph: &Graph,
        id: FileId,
        fs: &dyn FileSystem,
    ) -> std::io::Result<FileStat> {
        let stat = fs.stat(&graph.file(id).name)?;
        self.0.set_grow(id, Some(stat), None);
        Ok(stat)
    }
}

impl Default for FileState {
    fn default() -> Self {
        FileState::new()
    }
}
