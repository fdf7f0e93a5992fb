//! Relationship reconciliation

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::graph::{Relationship, extend_unique, tables};

use super::entities::EntityMerge;
use super::{IdAllocator, IdMapping, is_reobservation, normalize_title};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipMerge {
    pub relationships: Vec<Relationship>,
    /// Delta relationship id → merged relationship id
    pub mapping: IdMapping,
}

fn fold(target: &mut Relationship, incoming: &Relationship) {
    let reobserved = is_reobservation(&target.text_unit_ids, &incoming.text_unit_ids);
    extend_unique(&mut target.description, incoming.description.iter().cloned());
    extend_unique(&mut target.text_unit_ids, incoming.text_unit_ids.iter().cloned());
    if !reobserved {
        target.weight += incoming.weight;
    }
}

fn endpoint_key(source: &str, target: &str) -> (String, String) {
    (normalize_title(source), normalize_title(target))
}

/// Fold delta relationships into base relationships.
///
/// Delta endpoints are first rewritten to merged entity titles, so
/// relationships of folded entities collapse onto one `(source, target)`
/// pair. Matching is direction-sensitive.
pub fn merge_relationships(
    base: &[Relationship],
    delta: &[Relationship],
    entities: &EntityMerge,
) -> Result<RelationshipMerge> {
    let mut merged: Vec<Relationship> = base.to_vec();
    let mut by_endpoints: HashMap<(String, String), usize> = HashMap::new();
    for (position, relationship) in merged.iter().enumerate() {
        by_endpoints
            .entry(endpoint_key(&relationship.source, &relationship.target))
            .or_insert(position);
    }

    let mut allocator = IdAllocator::new(base.iter().map(|r| r.id.as_str()));
    let mut mapping = IdMapping::new();

    for relationship in delta {
        let inconsistency = |detail: String| Error::MergeInputInconsistency {
            table: tables::RELATIONSHIPS.to_string(),
            key: relationship.id.clone(),
            detail,
        };
        if relationship.id.is_empty() {
            return Err(inconsistency(format!(
                "relationship {} -> {} has no id",
                relationship.source, relationship.target
            )));
        }
        let source = entities.resolve_title(&relationship.source).ok_or_else(|| {
            inconsistency(format!("source '{}' is not a delta entity", relationship.source))
        })?;
        let target = entities.resolve_title(&relationship.target).ok_or_else(|| {
            inconsistency(format!("target '{}' is not a delta entity", relationship.target))
        })?;

        let mut rewritten = relationship.clone();
        rewritten.source = source.to_string();
        rewritten.target = target.to_string();
        let key = endpoint_key(source, target);

        let position = match by_endpoints.get(&key) {
            Some(&position) => {
                fold(&mut merged[position], &rewritten);
                position
            }
            None => {
                let seed = format!("{}->{}", key.0, key.1);
                rewritten.id = allocator.allocate(&relationship.id, &seed);
                merged.push(rewritten);
                by_endpoints.insert(key, merged.len() - 1);
                merged.len() - 1
            }
        };
        mapping.insert(relationship.id.clone(), merged[position].id.clone());
    }

    for (index, relationship) in merged.iter_mut().enumerate() {
        relationship.human_readable_id = index as u64;
    }

    Ok(RelationshipMerge {
        relationships: merged,
        mapping,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Entity;
    use crate::merge::merge_entities;

    fn entity_merge(base: &[Entity], delta: &[Entity]) -> EntityMerge {
        merge_entities(base, delta).unwrap()
    }

    #[test]
    fn test_same_pair_merges_weight_and_descriptions() {
        let entities = vec![Entity::new("1", "A"), Entity::new("2", "B")];
        let em = entity_merge(&entities, &entities);

        let base = vec![Relationship::new("r1", "A", "B").with_description("desc1")];
        let delta = vec![Relationship::new("r2", "A", "B").with_description("desc2")];
        let out = merge_relationships(&base, &delta, &em).unwrap();

        assert_eq!(out.relationships.len(), 1);
        let merged = &out.relationships[0];
        assert_eq!(merged.weight, 2.0);
        assert_eq!(merged.description, vec!["desc1", "desc2"]);
        assert_eq!(out.mapping.get("r2"), Some("r1"));
    }

    #[test]
    fn test_direction_is_preserved() {
        let entities = vec![Entity::new("1", "A"), Entity::new("2", "B")];
        let em = entity_merge(&entities, &entities);

        let base = vec![Relationship::new("r1", "A", "B")];
        let delta = vec![Relationship::new("r2", "B", "A")];
        let out = merge_relationships(&base, &delta, &em).unwrap();
        assert_eq!(out.relationships.len(), 2);
        assert_eq!(out.mapping.get("r2"), Some("r2"));
    }

    #[test]
    fn test_endpoints_rewritten_through_entity_merge() {
        let base_entities = vec![Entity::new("1", "Acme Corp"), Entity::new("2", "Bob")];
        let delta_entities = vec![Entity::new("9", "ACME CORP"), Entity::new("10", "BOB")];
        let em = entity_merge(&base_entities, &delta_entities);

        let base = vec![Relationship::new("r1", "Bob", "Acme Corp").with_weight(2.0)];
        let delta = vec![Relationship::new("r9", "BOB", "ACME CORP").with_weight(1.5)];
        let out = merge_relationships(&base, &delta, &em).unwrap();

        assert_eq!(out.relationships.len(), 1);
        assert_eq!(out.relationships[0].source, "Bob");
        assert_eq!(out.relationships[0].weight, 3.5);
    }

    #[test]
    fn test_unknown_endpoint_fails_loudly() {
        let em = entity_merge(&[], &[Entity::new("1", "A")]);
        let delta = vec![Relationship::new("r1", "A", "GHOST")];
        match merge_relationships(&[], &delta, &em).unwrap_err() {
            Error::MergeInputInconsistency { table, key, detail } => {
                assert_eq!(table, "relationships");
                assert_eq!(key, "r1");
                assert!(detail.contains("GHOST"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_empty_delta_passes_base_through() {
        let base = vec![Relationship::new("r1", "A", "B")];
        let out = merge_relationships(&base, &[], &EntityMerge::default()).unwrap();
        assert_eq!(out.relationships, base);
        assert!(out.mapping.is_empty());
    }
}
