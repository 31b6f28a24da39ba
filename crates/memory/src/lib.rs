pub mod archive;
pub mod buffer;
pub mod conflict;
pub mod consolidation;
pub mod error;
pub mod export;
pub mod holding;
pub mod index;
pub mod knowledge;
pub mod persist;
pub mod plan;
pub mod resolution;
pub mod schema;
pub mod store;
pub mod stream;
pub mod system;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use archive::{ArchiveManager, ArchiveSnapshot, ArchiveSummary};
pub use buffer::ShortTermBuffer;
pub use conflict::ConflictPair;
pub use consolidation::{ConsolidationOptions, ConsolidationResult};
pub use error::{MemoryError, MemoryResult, SkippedOperation};
pub use export::ExportFormat;
pub use holding::{HoldingItem, HoldingStatus, ReviewAction};
pub use knowledge::KnowledgeBase;
pub use resolution::ResolutionResult;
pub use schema::{AtomicChunk, Category, Role, Turn};
pub use stream::StreamEvent;
pub use system::{HoldingReview, ImportReport, MemoryStats, MemorySystem, RecordOutcome};
