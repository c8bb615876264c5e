mod layout;
mod lock;
mod records;
mod replay;
mod store;
mod tracker;

pub use layout::StateLayout;
pub use lock::SpecLock;
pub use records::{ChangeAction, ChangeRecord, Details, STATUS_FAILED, STATUS_SUCCESS};
pub use replay::{replay_records, UndoEntry, UndoOutcome, UndoReport};
pub use store::{RollbackPoint, StateManager, TransientState};
pub use tracker::OperationTracker;
