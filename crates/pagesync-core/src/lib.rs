pub mod blocks;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod executor;
pub mod format;
pub mod plan;
pub mod remote;
pub mod session;

pub use blocks::{Block, BlockKind, BlockRef, Page, ParentRef, SyncedBlock, TextRun};
pub use engine::{EngineError, OpenedPage, PageSource, SyncEngine};
pub use executor::{Executor, SyncCache, SyncOutcome};
pub use plan::{compute_plan, Resolution, SyncPlan};
