pub mod backend;
pub mod checkpoint;
pub mod compaction;
pub mod keep;
pub mod revision;
pub mod stop;

pub use backend::{Backend, BackendError, BatchTx, MemoryBackend};
pub use compaction::{CompactionConfig, CompactionError, CompactionHandle, CompactionOutcome, Compactor};
pub use keep::{keep_set, KeepSet, KeepSetResolver};
pub use revision::Revision;
pub use stop::{StopSignal, Stopper};
