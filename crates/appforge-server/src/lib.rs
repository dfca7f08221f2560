//! HTTP entry and session coordination for the generation engine

pub mod diff;
pub mod server;
pub mod session;
pub mod snapshot;

pub use diff::unified_diff;
pub use server::{start_server, AppState};
pub use session::{SessionCoordinator, SessionDeps, SessionState, StateMetadata};
pub use snapshot::{FsSnapshotStore, NullSnapshotStore, SnapshotStore};
