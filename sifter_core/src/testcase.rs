use std::path::{Path, PathBuf};
use thiserror::Error;

/// MD5 digest of a candidate's bytes.
pub type ContentHash = [u8; 16];

#[derive(Error, Debug)]
pub enum TestcaseError {
    #[error("Failed to resolve testcase {path:?}: {source}")]
    Resolve {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Testcase {0:?} has no file name or parent directory")]
    NotAFile(PathBuf),
    #[error("Testcase file name {0:?} is not valid UTF-8")]
    NonUtf8Name(PathBuf),
    #[error("Failed to read candidate {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The testcase of one reduction session: the page the target navigates to,
/// the directory served around it, and the file being reduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testcase {
    landing_page: String,
    www_root: PathBuf,
    reduce_file: PathBuf,
}

impl Testcase {
    /// Resolves `landing` to a real path. The reduce file defaults to the
    /// landing page itself.
    pub fn resolve(landing: &Path) -> Result<Self, TestcaseError> {
        let real = landing
            .canonicalize()
            .map_err(|source| TestcaseError::Resolve {
                path: landing.to_path_buf(),
                source,
            })?;
        let www_root = real
            .parent()
            .ok_or_else(|| TestcaseError::NotAFile(real.clone()))?
            .to_path_buf();
        let landing_page = real
            .file_name()
            .ok_or_else(|| TestcaseError::NotAFile(real.clone()))?
            .to_str()
            .ok_or_else(|| TestcaseError::NonUtf8Name(real.clone()))?
            .to_string();
        Ok(Self {
            landing_page,
            www_root,
            reduce_file: real,
        })
    }

    /// Reduces a different file than the landing page, e.g. a script the
    /// page includes.
    pub fn with_reduce_file(mut self, reduce_file: &Path) -> Result<Self, TestcaseError> {
        self.reduce_file = reduce_file
            .canonicalize()
            .map_err(|source| TestcaseError::Resolve {
                path: reduce_file.to_path_buf(),
                source,
            })?;
        Ok(self)
    }

    pub fn landing_page(&self) -> &str {
        &self.landing_page
    }

    pub fn www_root(&self) -> &Path {
        &self.www_root
    }

    pub fn reduce_file(&self) -> &Path {
        &self.reduce_file
    }
}

pub fn content_hash(path: &Path) -> Result<ContentHash, TestcaseError> {
    let bytes = std::fs::read(path).map_err(|source| TestcaseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(md5::compute(&bytes).0)
}
