use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Short signature of a report that holds no crash.
pub const NO_CRASH_SIGNATURE: &str = "No crash detected";

/// Frame depth used when a crash is adopted as the reference signature.
pub const SIGNATURE_FRAMES: usize = 5;

#[derive(Error, Debug)]
pub enum CrashError {
    #[error("Crash log I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Signature file {path:?} is malformed: {source}")]
    Signature {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// What could be learned about a crash from the logs of one trial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashReport {
    /// Sanitizer error class, e.g. `heap-use-after-free` or `SEGV`.
    pub kind: Option<String>,
    /// Function names of the crashing stack, innermost first.
    pub frames: Vec<String>,
    /// Log the report was built from.
    pub source_log: Option<PathBuf>,
}

impl CrashReport {
    pub fn has_crash(&self) -> bool {
        self.kind.is_some() || !self.frames.is_empty()
    }

    pub fn short_signature(&self) -> String {
        match (&self.kind, self.frames.first()) {
            (None, None) => NO_CRASH_SIGNATURE.to_string(),
            (Some(kind), None) => kind.clone(),
            (None, Some(frame)) => format!("[@ {frame}]"),
            (Some(kind), Some(frame)) => format!("{kind} [@ {frame}]"),
        }
    }

    /// Fingerprint made of the error class and the top `max_frames` frames.
    pub fn build_signature(&self, max_frames: usize) -> Signature {
        Signature {
            kind: self.kind.clone(),
            frames: self.frames.iter().take(max_frames).cloned().collect(),
        }
    }

    /// MD5 over the full stack, hex encoded.
    pub fn stack_hash(&self) -> String {
        format!("{:x}", md5::compute(self.frames.join("\n").as_bytes()))
    }
}

/// Identity of the crash a reduction must preserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub kind: Option<String>,
    pub frames: Vec<String>,
}

impl Signature {
    pub fn matches(&self, report: &CrashReport) -> bool {
        if !report.has_crash() {
            return false;
        }
        if self.kind.is_some() && self.kind != report.kind {
            return false;
        }
        report.frames.starts_with(&self.frames)
    }

    pub fn load(path: &Path) -> Result<Self, CrashError> {
        let content = fs::read_to_string(path).map_err(|source| CrashError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CrashError::Signature {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), CrashError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| CrashError::Signature {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| CrashError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Builds crash reports from a directory of saved target logs.
pub trait CrashReporter: Send {
    fn build_report(&self, logs_dir: &Path) -> Result<CrashReport, CrashError>;
}

/// Reads AddressSanitizer-style logs.
///
/// The largest log with `asan` in its name wins; without one the stderr log
/// is scanned instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizerReporter;

impl SanitizerReporter {
    pub fn new() -> Self {
        SanitizerReporter
    }

    fn preferred_log(logs_dir: &Path) -> Result<Option<PathBuf>, CrashError> {
        let mut asan: Option<(u64, PathBuf)> = None;
        let mut stderr = None;
        let entries = fs::read_dir(logs_dir).map_err(|source| CrashError::Io {
            path: logs_dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CrashError::Io {
                path: logs_dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains("asan") {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if asan.as_ref().is_none_or(|(best, _)| size > *best) {
                    asan = Some((size, path));
                }
            } else if name.contains("stderr") {
                stderr = Some(path);
            }
        }
        Ok(asan.map(|(_, path)| path).or(stderr))
    }
}

impl CrashReporter for SanitizerReporter {
    fn build_report(&self, logs_dir: &Path) -> Result<CrashReport, CrashError> {
        let Some(log) = Self::preferred_log(logs_dir)? else {
            return Ok(CrashReport::default());
        };
        let bytes = fs::read(&log).map_err(|source| CrashError::Io {
            path: log.clone(),
            source,
        })?;
        let mut report = parse_sanitizer_log(&String::from_utf8_lossy(&bytes));
        report.source_log = Some(log);
        Ok(report)
    }
}

/// Extracts the error class and the first stack from sanitizer output.
pub fn parse_sanitizer_log(text: &str) -> CrashReport {
    let mut report = CrashReport::default();
    for line in text.lines() {
        if report.kind.is_none() {
            report.kind = parse_error_kind(line);
        }
        let Some((index, function)) = parse_frame(line) else {
            continue;
        };
        // A second `#0` starts another stack (allocation, free, ...).
        if index == 0 && !report.frames.is_empty() {
            break;
        }
        report.frames.push(function);
    }
    report
}

fn parse_error_kind(line: &str) -> Option<String> {
    let (_, rest) = line.split_once("ERROR: ")?;
    let (sanitizer, detail) = rest.split_once(": ")?;
    if !sanitizer.ends_with("Sanitizer") {
        return None;
    }
    detail.split_whitespace().next().map(str::to_string)
}

fn parse_frame(line: &str) -> Option<(u32, String)> {
    let rest = line.trim_start().strip_prefix('#')?;
    let (number, rest) = rest.split_once(char::is_whitespace)?;
    let index = number.parse().ok()?;
    let (_, function) = rest.split_once(" in ")?;
    let end = [" /", " (", " ["]
        .iter()
        .filter_map(|sep| function.find(sep))
        .min()
        .unwrap_or(function.len());
    let function = function[..end].trim();
    if function.is_empty() {
        return None;
    }
    Some((index, function.to_string()))
}
