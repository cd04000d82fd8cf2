use std::os::unix::prelude::MetadataExt;

/// Stat info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileStat {
    Missing,
    File { mtime: u32, size: u32 },
}

impl FileStat {
    pub fn exists(&self) -> bool {
        matches!(self, FileStat::File { .. })
    }
}

pub trait FileSystem {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
    /// stat() an on-disk path, producing its FileStat.
    fn stat(&self, path: &str) -> std::io::Result<FileStat>;
}

pub struct RealFileSystem {}
impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn stat(&self, path: &str) -> std::io::Result<FileStat> {
        Ok(match std::fs::metadata(path) {
            Ok(meta) => FileStat::File {
                mtime: meta.mtime() as u32,
                size: meta.size() as u32,
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    FileStat::Missing
                } else {
                    return Err(err);
                }
            }
        })
    }
}
