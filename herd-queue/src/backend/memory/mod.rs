//! In-process job store. State is lost on restart; use it for tests and
//! single-process deployments.

mod storage;

pub use storage::MemoryStore;
