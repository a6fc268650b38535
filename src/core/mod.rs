pub mod command;
pub mod compression;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod ssh;

pub use command::{detect_dialect, BuiltCommand, RsyncCommandBuilder, RsyncDialect, WrapperScript};
pub use compression::{Archiver, TarArchiver};
pub use executor::{JobRunner, RsyncConfig, RsyncManager, SyncOptions, TransferResult};
pub use lock::{JobLockGuard, SyncLockManager};
pub use manager::{parse_schedule, JobUpdate, SyncManager};
pub use progress::{ProgressEvent, ProgressParser};
pub use retry::{run_with_retry, RetryPolicy};
pub use ssh::{probe_connection, SshConfig, PROBE_MARKER};
