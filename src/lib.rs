pub mod engine;
pub mod error;
pub mod ffi;
pub mod patch;
pub mod queue;
pub mod remote;
pub mod store;

pub use engine::{
    BackgroundScheduler, DrainReport, DropReason, FailureListener, NoScheduler, SyncConfig,
    SyncEngine, TableDrain,
};
pub use error::SyncError;
pub use queue::{OpKind, OpLog, PendingOp};
pub use remote::{RemoteError, RemoteId, RemoteStore};
pub use store::RecordStore;
