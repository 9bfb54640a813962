use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FileImageError {
    #[error("cannot open \"{path}\" for reading")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("\"{path}\" is not a regular file")]
    NotRegular { path: PathBuf },
    #[error("file \"{path}\" is empty")]
    Empty { path: PathBuf },
    #[error("cannot map \"{path}\" into memory")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file mapped read-only for the lifetime of this value.
///
/// The core file is held this way for the whole analyzer run; module files
/// are held only across a single recovery call. Dropping the image unmaps
/// the file and closes the descriptor.
pub struct FileImage {
    path: PathBuf,
    map: memmap2::Mmap,
}

impl FileImage {
    pub fn open(path: &Path) -> Result<Self, FileImageError> {
        let file = File::open(path).map_err(|source| FileImageError::Open {
            path: path.to_owned(),
            source,
        })?;
        let metadata = file.metadata().map_err(|source| FileImageError::Open {
            path: path.to_owned(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(FileImageError::NotRegular {
                path: path.to_owned(),
            });
        }
        if metadata.len() == 0 {
            return Err(FileImageError::Empty {
                path: path.to_owned(),
            });
        }
        // SAFETY: the mapping is private and read-only; a concurrent
        // truncation of the underlying file could still fault, which is the
        // standard caveat for mapped readers and acceptable for an offline
        // analysis tool.
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| FileImageError::Map {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            path: path.to_owned(),
            map,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }
}
