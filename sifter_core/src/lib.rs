pub mod artifacts;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod crash;
pub mod monitor;
pub mod oracle;
pub mod process;
pub mod server;
pub mod target;
pub mod testcase;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{CacheEntry, InMemoryResultCache, ResultCache};
pub use cancel::{CancelGuard, CancelToken};
pub use config::{ConfigError, EnvOverrides, IgnoreCategory, IgnoreSet, RunConfig, SifterConfig};
pub use crash::{CrashError, CrashReport, CrashReporter, SanitizerReporter, Signature};
pub use monitor::{IdleMonitor, IdleSettings};
pub use oracle::{OracleError, ReductionOracle};
pub use process::{CommandProcess, CommandProcessConfig};
pub use server::{
    AllowAllExcept, AllowNone, AllowSet, ContentServer, LocalFileServer, LocalServerFactory,
    OptionalFiles, ServerError, ServerFactory,
};
pub use target::{ExitReason, FailureClass, TargetController, TargetError, TargetProcess};
pub use testcase::{Testcase, TestcaseError};
