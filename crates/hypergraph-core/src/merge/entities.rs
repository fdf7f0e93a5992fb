//! Entity reconciliation

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::graph::{Entity, extend_unique, tables};

use super::{IdAllocator, IdMapping, is_reobservation, normalize_title};

/// Merged entities with the mappings relationships and communities need
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityMerge {
    pub entities: Vec<Entity>,
    /// Delta entity id → merged entity id
    pub mapping: IdMapping,
    /// Normalized delta title → merged display title
    pub titles: HashMap<String, String>,
}

impl EntityMerge {
    /// Merged display title for a delta endpoint
    pub fn resolve_title(&self, title: &str) -> Option<&str> {
        self.titles.get(&normalize_title(title)).map(String::as_str)
    }
}

fn fold(target: &mut Entity, incoming: &Entity) {
    let reobserved = is_reobservation(&target.text_unit_ids, &incoming.text_unit_ids);
    extend_unique(&mut target.description, incoming.description.iter().cloned());
    extend_unique(&mut target.text_unit_ids, incoming.text_unit_ids.iter().cloned());
    if !reobserved {
        target.frequency += incoming.frequency;
    }
    if target.entity_type.trim().is_empty() {
        target.entity_type = incoming.entity_type.clone();
    }
}

/// Fold delta entities into base entities by normalized title.
///
/// Base records keep their position and id; unmatched delta records follow
/// in delta order. `human_readable_id` is reassigned densely.
pub fn merge_entities(base: &[Entity], delta: &[Entity]) -> Result<EntityMerge> {
    let mut merged: Vec<Entity> = base.to_vec();
    let mut by_title: HashMap<String, usize> = HashMap::new();
    for (position, entity) in merged.iter().enumerate() {
        by_title
            .entry(normalize_title(&entity.title))
            .or_insert(position);
    }

    let mut allocator = IdAllocator::new(base.iter().map(|e| e.id.as_str()));
    let mut mapping = IdMapping::new();
    let mut titles = HashMap::new();

    for entity in delta {
        if entity.id.is_empty() {
            return Err(Error::MergeInputInconsistency {
                table: tables::ENTITIES.to_string(),
                key: entity.title.clone(),
                detail: "delta entity has no id".to_string(),
            });
        }
        let key = normalize_title(&entity.title);

        let position = match by_title.get(&key) {
            Some(&position) => {
                fold(&mut merged[position], entity);
                position
            }
            None => {
                let mut fresh = entity.clone();
                fresh.id = allocator.allocate(&entity.id, &key);
                merged.push(fresh);
                by_title.insert(key.clone(), merged.len() - 1);
                merged.len() - 1
            }
        };

        let target = &merged[position];
        if let Some(previous) = mapping.get(&entity.id) {
            if previous != target.id {
                return Err(Error::MergeInputInconsistency {
                    table: tables::ENTITIES.to_string(),
                    key: entity.id.clone(),
                    detail: format!(
                        "delta id is shared by entities that merge into '{}' and '{}'",
                        previous, target.id
                    ),
                });
            }
        }
        mapping.insert(entity.id.clone(), target.id.clone());
        titles.insert(key, target.title.clone());
    }

    for (index, entity) in merged.iter_mut().enumerate() {
        entity.human_readable_id = index as u64;
    }

    Ok(EntityMerge {
        entities: merged,
        mapping,
        titles,
    })
}
