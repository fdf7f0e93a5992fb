//! Model-backed and graph operations composed by the workflows

pub mod claims;
pub mod extract;
pub mod graph;
pub mod resolve;
pub mod summarize;

pub use claims::ClaimExtraction;
pub use extract::{GraphExtraction, entity_id, gleaned_completion, relationship_id};
pub use graph::{finalize_graph, node_degrees, percentile, prune_graph};
pub use resolve::{EntityResolver, TitleAliases, aliases_from_groups, fold_aliases};
pub use summarize::{DescriptionSummarizer, estimate_tokens, fit_descriptions};
