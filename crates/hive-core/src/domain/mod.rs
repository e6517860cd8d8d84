//! Domain model (ids, task records, leases, loop state, errors).

pub mod errors;
pub mod ids;
pub mod lease;
pub mod state;
pub mod task;

pub use self::errors::{ErrorKind, HiveError};
pub use self::ids::{Id, IdMarker, LeaseId, LoopId, ParseIdError, TaskId};
pub use self::lease::{ClaimOutcome, Lease};
pub use self::state::{IterationRecord, LoopState, LoopStatus};
pub use self::task::{Dependencies, Priority, TaskPatch, TaskRecord, TaskStatus};
