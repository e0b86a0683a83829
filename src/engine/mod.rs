//! Engine module: memory budget, content loading and index writers, plus the on-disk pieces the
//! CLI uses.

pub mod arg_parser;
pub mod cli;
pub mod content_index;
pub mod content_loader;
pub mod disk;
pub mod memory_budget;
pub mod progress;
pub mod writer_pool;

// Re-export commonly used items
pub use arg_parser::Cli;
pub use cli::handle_run;
pub use content_index::{ContentIndexer, ContentIndexes};
pub use content_loader::{ContentLoader, LoadedContent};
pub use disk::{DiskContentCache, DiskFile, collect_file_set, glob_match, is_os_hidden_file};
pub use memory_budget::MemoryBudget;
pub use writer_pool::{WriteTask, WriterPool, WriterPoolConfig};
