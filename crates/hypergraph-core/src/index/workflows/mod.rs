//! Built-in workflows
//!
//! Standard workflows read from and write to the run output. On update runs
//! that output is the delta store, and the `update_*` workflows fold it into
//! the merged store using the persisted base graph.

mod extract_covariates;
mod extract_graph;
mod finalize;
mod load_input;
mod update;

pub use extract_covariates::ExtractCovariates;
pub use extract_graph::{ExtractGraph, SummarizeDescriptions};
pub use finalize::{FinalizeGraph, PruneGraph};
pub use load_input::LoadInput;
pub use update::{
    COMMUNITY_ID_MAPPING_KEY, ENTITY_ID_MAPPING_KEY, FINAL_DOCUMENTS_KEY, MERGED_ENTITIES_KEY,
    MERGED_RELATIONSHIPS_KEY, RELATIONSHIP_ID_MAPPING_KEY, UpdateCleanState, UpdateCommunities,
    UpdateCovariates, UpdateEntitiesRelationships, UpdateFinalDocuments,
};
