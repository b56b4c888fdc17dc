use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Only alpha-numeric characters accepted in URL: {0:?}")]
    InvalidUrl(String),
    #[error("URL collision on {0:?}")]
    MapCollision(String),
    #[error("Redirect target for {0:?} must not be empty")]
    EmptyRedirect(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a serve call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStatus {
    /// Serving stopped before the timeout: every required file was served
    /// or the continuation predicate asked to stop.
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOutcome {
    pub status: ServeStatus,
    pub served: Vec<PathBuf>,
}

/// Decides which files of a served directory may go unrequested.
pub trait OptionalFiles: Send + Sync {
    fn is_optional(&self, file_name: &str) -> bool;
}

/// Every file is optional except one, normally the landing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowAllExcept(pub String);

impl OptionalFiles for AllowAllExcept {
    fn is_optional(&self, file_name: &str) -> bool {
        file_name != self.0
    }
}

/// Every file is required.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllowNone;

impl OptionalFiles for AllowNone {
    fn is_optional(&self, _file_name: &str) -> bool {
        false
    }
}

/// Exactly the listed files are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowSet(pub HashSet<String>);

impl OptionalFiles for AllowSet {
    fn is_optional(&self, file_name: &str) -> bool {
        self.0.contains(file_name)
    }
}

pub type DynamicProducer = Box<dyn Fn() -> Vec<u8> + Send + Sync>;

pub struct DynamicResponse {
    pub producer: DynamicProducer,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub target: String,
    pub required: bool,
}

/// URL table of a server: redirects and dynamically produced responses.
#[derive(Default)]
pub struct ServerMap {
    redirects: BTreeMap<String, Redirect>,
    dynamic: BTreeMap<String, DynamicResponse>,
}

impl ServerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trims surrounding `/` and rejects anything but word characters.
    pub fn check_url(url: &str) -> Result<String, ServerError> {
        let trimmed = url.trim_matches('/');
        if trimmed.chars().any(|c| !(c.is_alphanumeric() || c == '_')) {
            return Err(ServerError::InvalidUrl(url.to_string()));
        }
        Ok(trimmed.to_string())
    }

    pub fn set_redirect(&mut self, url: &str, target: &str, required: bool) -> Result<(), ServerError> {
        let url = Self::check_url(url)?;
        if target.is_empty() {
            return Err(ServerError::EmptyRedirect(url));
        }
        if self.dynamic.contains_key(&url) {
            return Err(ServerError::MapCollision(url));
        }
        log::debug!("mapping redirect {:?} -> {:?} (required: {})", url, target, required);
        self.redirects.insert(
            url,
            Redirect {
                target: target.to_string(),
                required,
            },
        );
        Ok(())
    }

    pub fn set_dynamic(
        &mut self,
        url: &str,
        producer: DynamicProducer,
        mime_type: &str,
    ) -> Result<(), ServerError> {
        let url = Self::check_url(url)?;
        if self.redirects.contains_key(&url) {
            return Err(ServerError::MapCollision(url));
        }
        log::debug!("mapping dynamic response {:?} ({})", url, mime_type);
        self.dynamic.insert(
            url,
            DynamicResponse {
                producer,
                mime_type: mime_type.to_string(),
            },
        );
        Ok(())
    }

    pub fn dynamic(&self, url: &str) -> Option<&DynamicResponse> {
        self.dynamic.get(url)
    }
}

/// Serves a candidate's directory to the target.
///
/// A server's timeout is fixed when it is built; a shorter timeout needs a
/// new server.
pub trait ContentServer: Send {
    /// URL the target should load for `path`, relative to the served root.
    fn url_for(&self, path: &str) -> String;

    fn register_redirect(&mut self, path: &str, target: &str, required: bool)
    -> Result<(), ServerError>;

    fn register_dynamic(
        &mut self,
        path: &str,
        producer: DynamicProducer,
        mime_type: &str,
    ) -> Result<(), ServerError>;

    /// Blocks until every required file is served, `keep_serving` returns
    /// `false`, or the timeout elapses.
    fn serve_directory(
        &mut self,
        root: &Path,
        keep_serving: &dyn Fn() -> bool,
        optional: Option<&dyn OptionalFiles>,
    ) -> Result<ServeOutcome, ServerError>;

    fn close(&mut self) -> Result<(), ServerError>;
}

pub trait ServerFactory: Send {
    fn create(&self, root: &Path, timeout: Duration) -> Result<Box<dyn ContentServer>, ServerError>;

    /// Whether servers from this factory accept `register_redirect`, which
    /// the harness needs.
    fn supports_redirects(&self) -> bool {
        true
    }
}

/// Interval at which [`LocalFileServer`] re-checks its continuation predicate.
const LOCAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A server that hands the target `file://` URLs instead of speaking HTTP.
///
/// It cannot observe requests, so a serve call only ends when the
/// predicate gives up or the timeout elapses. Redirects need a real HTTP
/// server and are rejected, so it only works without the harness.
pub struct LocalFileServer {
    root: PathBuf,
    timeout: Duration,
    map: ServerMap,
    dynamic_dir: tempfile::TempDir,
}

impl LocalFileServer {
    pub fn new(root: &Path, timeout: Duration) -> Result<Self, ServerError> {
        Ok(Self {
            root: root.to_path_buf(),
            timeout: timeout.max(Duration::from_secs(1)),
            map: ServerMap::new(),
            dynamic_dir: tempfile::Builder::new().prefix("sifter-dynamic-").tempdir()?,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl ContentServer for LocalFileServer {
    fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match ServerMap::check_url(path) {
            Ok(url) if self.map.dynamic(&url).is_some() => {
                format!("file://{}", self.dynamic_dir.path().join(url).display())
            }
            _ => format!("file://{}", self.root.join(path).display()),
        }
    }

    fn register_redirect(&mut self, path: &str, _target: &str, _required: bool) -> Result<(), ServerError> {
        Err(ServerError::Unsupported(format!(
            "redirect {path:?} requires an HTTP server; use no-harness mode"
        )))
    }

    fn register_dynamic(
        &mut self,
        path: &str,
        producer: DynamicProducer,
        mime_type: &str,
    ) -> Result<(), ServerError> {
        let url = ServerMap::check_url(path)?;
        std::fs::write(self.dynamic_dir.path().join(&url), producer())?;
        self.map.set_dynamic(&url, producer, mime_type)
    }

    fn serve_directory(
        &mut self,
        root: &Path,
        keep_serving: &dyn Fn() -> bool,
        _optional: Option<&dyn OptionalFiles>,
    ) -> Result<ServeOutcome, ServerError> {
        if root != self.root {
            self.root = root.to_path_buf();
        }
        // A timeout too large to represent never expires.
        let deadline = Instant::now().checked_add(self.timeout);
        loop {
            if !keep_serving() {
                return Ok(ServeOutcome {
                    status: ServeStatus::Completed,
                    served: Vec::new(),
                });
            }
            let mut pause = LOCAL_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    log::debug!("serve timed out after {:?}", self.timeout);
                    return Ok(ServeOutcome {
                        status: ServeStatus::TimedOut,
                        served: Vec::new(),
                    });
                }
                pause = pause.min(deadline - now);
            }
            std::thread::sleep(pause);
        }
    }

    fn close(&mut self) -> Result<(), ServerError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalServerFactory;

impl ServerFactory for LocalServerFactory {
    fn create(&self, root: &Path, timeout: Duration) -> Result<Box<dyn ContentServer>, ServerError> {
        Ok(Box::new(LocalFileServer::new(root, timeout)?))
    }

    fn supports_redirects(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn optional_file_policies() {
        let all_but = AllowAllExcept("test.html".to_string());
        assert!(all_but.is_optional("style.css"));
        assert!(!all_but.is_optional("test.html"));

        assert!(!AllowNone.is_optional("style.css"));

        let set = AllowSet(["a.js".to_string()].into_iter().collect());
        assert!(set.is_optional("a.js"));
        assert!(!set.is_optional("b.js"));
    }

    #[test]
    fn check_url_trims_and_validates() {
        assert_eq!(ServerMap::check_url("/harness/").unwrap(), "harness");
        assert_eq!(ServerMap::check_url("next_test").unwrap(), "next_test");
        assert!(matches!(
            ServerMap::check_url("../etc/passwd"),
            Err(ServerError::InvalidUrl(_))
        ));
    }

    #[test]
    fn map_rejects_collisions_and_empty_targets() {
        let mut map = ServerMap::new();
        map.set_redirect("first_test", "test.html", true).unwrap();
        map.set_redirect("grz_optional", "x.html", false).unwrap();
        assert!(matches!(
            map.set_dynamic("first_test", Box::new(Vec::<u8>::new), "text/html"),
            Err(ServerError::MapCollision(_))
        ));
        map.set_dynamic("harness", Box::new(|| b"<html>".to_vec()), "text/html")
            .unwrap();
        assert!(matches!(
            map.set_redirect("harness", "test.html", true),
            Err(ServerError::MapCollision(_))
        ));
        assert!(matches!(
            map.set_redirect("next_test", "", true),
            Err(ServerError::EmptyRedirect(_))
        ));
        assert_eq!((map.dynamic("harness").unwrap().producer)(), b"<html>");
    }

    #[test]
    fn local_server_urls_point_at_files() {
        let dir = tempdir().unwrap();
        let mut server = LocalFileServer::new(dir.path(), Duration::from_secs(10)).unwrap();
        assert_eq!(
            server.url_for("test.html"),
            format!("file://{}", dir.path().join("test.html").display())
        );

        server
            .register_dynamic("harness", Box::new(|| b"<html>harness</html>".to_vec()), "text/html")
            .unwrap();
        let url = server.url_for("harness");
        let path = url.strip_prefix("file://").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"<html>harness</html>");

        assert!(matches!(
            server.register_redirect("first_test", "test.html", true),
            Err(ServerError::Unsupported(_))
        ));
        assert!(!LocalServerFactory.supports_redirects());
    }

    #[test]
    fn local_server_completes_when_predicate_stops() {
        let dir = tempdir().unwrap();
        let mut server = LocalFileServer::new(dir.path(), Duration::from_secs(30)).unwrap();
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let outcome = server
            .serve_directory(
                dir.path(),
                &|| calls.fetch_add(1, Ordering::SeqCst) < 2,
                None,
            )
            .unwrap();
        assert_eq!(outcome.status, ServeStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn local_server_times_out() {
        let dir = tempdir().unwrap();
        let mut server = LocalFileServer::new(dir.path(), Duration::from_millis(10)).unwrap();
        // The timeout is floored at one second.
        assert_eq!(server.timeout(), Duration::from_secs(1));
        let outcome = server.serve_directory(dir.path(), &|| true, None).unwrap();
        assert_eq!(outcome.status, ServeStatus::TimedOut);
    }

    #[test]
    fn local_server_survives_unrepresentable_timeout() {
        let dir = tempdir().unwrap();
        let mut server = LocalFileServer::new(dir.path(), Duration::MAX).unwrap();
        let calls = AtomicUsize::new(0);
        let outcome = server
            .serve_directory(
                dir.path(),
                &|| calls.fetch_add(1, Ordering::SeqCst) < 1,
                None,
            )
            .unwrap();
        assert_eq!(outcome.status, ServeStatus::Completed);
    }
}
