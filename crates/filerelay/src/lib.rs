//! filerelay: durable replication of files from a watched directory to
//! object storage.
//!
//! Files found by [`discovery`] become upload tasks on a durable queue
//! ([`filerelay_store::SqliteDeliveryQueue`]). An external upload engine
//! consumes the tasks and reports one status record per attempt. The
//! [`reconciler::AckReconciler`] reads those records in order, deletes
//! uploaded files, and resubmits failures within the retry budget. Both
//! halves persist their position as cursors so a restart resumes where the
//! previous run stopped.

pub mod config;
pub mod cursor;
pub mod discovery;
pub mod error;
pub mod key_template;
pub mod reconciler;
pub mod relay;
pub mod shutdown;
pub mod submitter;

#[cfg(test)]
mod testing;

pub use config::{DiscoveryMode, RelayConfig};
pub use cursor::Cursor;
pub use error::{ConfigError, RelayError, Result};
pub use key_template::KeyTemplate;
pub use reconciler::{AckReconciler, ReconcilerSettings, RecordAction};
pub use relay::{RelayService, RelayStatus};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use submitter::UploadSubmitter;
