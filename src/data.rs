//! Opaque data providers.
//!
//! Shader binaries, texture contents, and buffer initializers reach the
//! renderer either as in-memory blobs or as file paths resolved lazily by
//! the caller's asset layer. A size-only provider reserves space without
//! contents (scratch buffers the GPU fills). The renderer never interprets
//! the bytes, it only copies them.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub enum DataProvider {
    #[default]
    Empty,
    Memory(Arc<[u8]>),
    File(PathBuf),
    /// A byte count with no contents behind it.
    Uninitialized(usize),
}

impl DataProvider {
    pub fn from_memory(bytes: impl Into<Arc<[u8]>>) -> DataProvider {
        DataProvider::Memory(bytes.into())
    }

    pub fn from_file(path: impl Into<PathBuf>) -> DataProvider {
        DataProvider::File(path.into())
    }

    pub fn uninitialized(size: usize) -> DataProvider {
        DataProvider::Uninitialized(size)
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, DataProvider::Empty)
    }

    /// Resolves the provider to bytes; `None` for providers that only carry
    /// a size. File providers hit the filesystem on every call; callers that
    /// care should fetch once per frame at most.
    pub fn fetch(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            DataProvider::Empty | DataProvider::Uninitialized(_) => None,
            DataProvider::Memory(bytes) => Some(Cow::Borrowed(bytes)),
            DataProvider::File(path) => {
                let bytes = std::fs::read(path)
                    .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
                Some(Cow::Owned(bytes))
            }
        }
    }

    /// Number of bytes this provider stands for.
    pub fn size(&self) -> usize {
        match self {
            DataProvider::Empty => 0,
            DataProvider::Memory(bytes) => bytes.len(),
            DataProvider::File(path) => std::fs::metadata(path)
                .map(|m| m.len() as usize)
                .unwrap_or_else(|e| panic!("failed to stat {}: {}", path.display(), e)),
            DataProvider::Uninitialized(size) => *size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_provider_round_trips() {
        let provider = DataProvider::from_memory(vec![1u8, 2, 3]);
        assert!(provider.is_valid());
        assert_eq!(provider.size(), 3);
        assert_eq!(provider.fetch().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn empty_provider_is_invalid() {
        assert!(!DataProvider::Empty.is_valid());
        assert!(DataProvider::Empty.fetch().is_none());
    }

    #[test]
    fn uninitialized_provider_has_size_but_no_bytes() {
        let provider = DataProvider::uninitialized(4096);
        assert!(provider.is_valid());
        assert_eq!(provider.size(), 4096);
        assert!(provider.fetch().is_none());
    }
}
