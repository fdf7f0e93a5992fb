//! Incremental merge engine
//!
//! Reconciles a persisted base graph with the delta graph extracted from new
//! text units. The engine is a pure function of its inputs:
//!
//! ```text
//! Load(base, delta) -> Reconcile -> Emit(merged, mappings)
//! ```
//!
//! Every delta identifier appears in the emitted mappings, pointing either at
//! its own (possibly re-allocated) identifier or at the base record it was
//! folded into. Merging with an empty side is the identity, and folding a
//! delta in a second time changes nothing.

mod communities;
mod entities;
mod relationships;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{Community, Entity, Relationship};

pub use communities::{CommunityMerge, merge_communities};
pub use entities::{EntityMerge, merge_entities};
pub use relationships::{RelationshipMerge, merge_relationships};

/// Comparison key for entity titles: trimmed, whitespace collapsed, uppercased
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Delta identifier → merged identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMapping(BTreeMap<String, String>);

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.0.insert(from.into(), to.into());
    }

    pub fn get(&self, from: &str) -> Option<&str> {
        self.0.get(from).map(String::as_str)
    }

    pub fn contains(&self, from: &str) -> bool {
        self.0.contains_key(from)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries whose delta id was folded into a different merged id
    pub fn remapped(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(from, to)| from != to)
    }
}

/// Identifier allocation for records that keep their own identity.
///
/// A record keeps its id unless that id is already taken by a different
/// merged record; then a v5 UUID derived from `seed` and the id is used, so
/// reruns allocate the same replacement.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    used: HashSet<String>,
}

impl IdAllocator {
    pub(crate) fn new<'a>(taken: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            used: taken.into_iter().map(str::to_string).collect(),
        }
    }

    pub(crate) fn allocate(&mut self, preferred: &str, seed: &str) -> String {
        if !preferred.is_empty() && self.used.insert(preferred.to_string()) {
            return preferred.to_string();
        }
        let mut attempt = 0u32;
        loop {
            let name = format!("{}:{}:{}", seed, preferred, attempt);
            let candidate = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string();
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            attempt += 1;
        }
    }
}

/// True when every incoming provenance id is already recorded.
///
/// Folding such a record again must not inflate counts.
pub(crate) fn is_reobservation(existing: &[String], incoming: &[String]) -> bool {
    !incoming.is_empty() && incoming.iter().all(|id| existing.contains(id))
}

/// One side of a merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphTables {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub communities: Vec<Community>,
}

impl GraphTables {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.communities.is_empty()
    }
}

/// Merged tables plus every identifier mapping produced on the way
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub tables: GraphTables,
    pub entity_mapping: IdMapping,
    pub relationship_mapping: IdMapping,
    /// Delta community number → merged community number
    pub community_mapping: BTreeMap<i64, i64>,
    pub community_id_mapping: IdMapping,
}

/// Loaded merge inputs; [`reconcile`](Self::reconcile) emits the result
#[derive(Debug, Clone)]
pub struct IncrementalMergeEngine {
    base: GraphTables,
    delta: GraphTables,
}

impl IncrementalMergeEngine {
    pub fn load(base: GraphTables, delta: GraphTables) -> Self {
        Self { base, delta }
    }

    /// Entities first, then relationships through the entity mapping, then
    /// communities through both mappings.
    pub fn reconcile(&self) -> Result<MergeOutput> {
        let entities = merge_entities(&self.base.entities, &self.delta.entities)?;
        let relationships = merge_relationships(
            &self.base.relationships,
            &self.delta.relationships,
            &entities,
        )?;
        let communities = merge_communities(
            &self.base.communities,
            &self.delta.communities,
            &entities.mapping,
            &relationships.mapping,
        )?;

        info!(
            entities = entities.entities.len(),
            relationships = relationships.relationships.len(),
            communities = communities.communities.len(),
            folded_entities = entities.mapping.remapped().count(),
            "Merged delta graph into base"
        );

        Ok(MergeOutput {
            tables: GraphTables {
                entities: entities.entities,
                relationships: relationships.relationships,
                communities: communities.communities,
            },
            entity_mapping: entities.mapping,
            relationship_mapping: relationships.mapping,
            community_mapping: communities.mapping,
            community_id_mapping: communities.id_mapping,
        })
    }
}
