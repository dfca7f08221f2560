//! Generation engine - node trees, tool runtime, beam-search sub-agents,
//! validators, and the stage graph driving them.

pub mod generate;
pub mod namegen;
pub mod node;
pub mod playbooks;
pub mod search;
pub mod stages;
pub mod tools;
pub mod validators;

pub use generate::{GenApp, GenContext, GenDeps, StageOutput};
pub use node::{NodeData, NodeDump, NodeId, NodeTree};
pub use search::{SearchConfig, SearchError, StageSpec, SubAgent};
pub use tools::{CustomTool, ToolPassOutcome, ToolRequest, ToolRuntime};
pub use validators::{compact_error, StageChecks};
