use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact prefix {0:?} has no file name")]
    BadPrefix(PathBuf),
    #[error("Cannot copy non-file/non-directory: {0:?}")]
    UnsupportedEntry(PathBuf),
    #[error("Artifact I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn split_prefix(prefix: &Path) -> Result<(&Path, String), ArtifactError> {
    let name = prefix
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArtifactError::BadPrefix(prefix.to_path_buf()))?;
    let parent = match prefix.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    Ok((parent, format!("{name}_")))
}

/// Directory holding the logs of the trial that used `prefix`.
pub fn logs_dir(prefix: &Path) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push("_logs");
    PathBuf::from(name)
}

/// Lists every entry named `<prefix>_<suffix>`, returning `(path, suffix)`.
pub fn entries_with_prefix(prefix: &Path) -> Result<Vec<(PathBuf, String)>, ArtifactError> {
    let (parent, stem) = split_prefix(prefix)?;
    let mut found = Vec::new();
    let read_dir = match fs::read_dir(parent) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(io_err(parent)(e)),
    };
    for entry in read_dir {
        let entry = entry.map_err(io_err(parent))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(suffix) = name.strip_prefix(&stem) {
            found.push((entry.path(), suffix.to_string()));
        }
    }
    found.sort();
    Ok(found)
}

/// Copies every `<cached>_<suffix>` entry to `<new>_<suffix>`, keeping the
/// entry kind. Anything that is neither a file nor a directory is fatal.
pub fn replay_artifacts(cached: &Path, new: &Path) -> Result<usize, ArtifactError> {
    let (new_parent, new_stem) = split_prefix(new)?;
    let mut copied = 0;
    for (source, suffix) in entries_with_prefix(cached)? {
        let dest = new_parent.join(format!("{new_stem}{suffix}"));
        if source.is_file() {
            fs::copy(&source, &dest).map_err(io_err(&source))?;
        } else if source.is_dir() {
            copy_dir_recursive(&source, &dest)?;
        } else {
            return Err(ArtifactError::UnsupportedEntry(source));
        }
        log::debug!("replayed {:?} -> {:?}", source, dest);
        copied += 1;
    }
    Ok(copied)
}

pub fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<(), ArtifactError> {
    fs::create_dir(dest).map_err(io_err(dest))?;
    for entry in fs::read_dir(source).map_err(io_err(source))? {
        let entry = entry.map_err(io_err(source))?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else if path.is_file() {
            fs::copy(&path, &target).map_err(io_err(&path))?;
        } else {
            return Err(ArtifactError::UnsupportedEntry(path));
        }
    }
    Ok(())
}
