//! Community reconciliation
//!
//! Delta memberships are rewritten through the entity mapping first. A delta
//! community whose member set is a subset or superset of a base community at
//! the same level is absorbed into it; anything else becomes a new
//! community, keeping its number when free and taking `max + 1` otherwise.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::graph::{Community, extend_unique, tables};

use super::{IdAllocator, IdMapping};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityMerge {
    pub communities: Vec<Community>,
    /// Delta community number → merged community number
    pub mapping: BTreeMap<i64, i64>,
    /// Delta community id → merged community id
    pub id_mapping: IdMapping,
}

fn remap_ids(
    community: &Community,
    ids: &[String],
    mapping: &IdMapping,
    what: &str,
) -> Result<Vec<String>> {
    let mut remapped = Vec::with_capacity(ids.len());
    for id in ids {
        let merged = mapping.get(id).ok_or_else(|| Error::MergeInputInconsistency {
            table: tables::COMMUNITIES.to_string(),
            key: community.id.clone(),
            detail: format!("{} '{}' is absent from the delta graph", what, id),
        })?;
        remapped.push(merged.to_string());
    }
    let mut unique = Vec::with_capacity(remapped.len());
    extend_unique(&mut unique, remapped);
    Ok(unique)
}

fn member_set(community: &Community) -> BTreeSet<&str> {
    community.entity_ids.iter().map(String::as_str).collect()
}

fn remap_number(
    community: &Community,
    number: i64,
    mapping: &BTreeMap<i64, i64>,
) -> Result<i64> {
    if number < 0 {
        return Ok(number);
    }
    mapping
        .get(&number)
        .copied()
        .ok_or_else(|| Error::MergeInputInconsistency {
            table: tables::COMMUNITIES.to_string(),
            key: community.id.clone(),
            detail: format!("community {} is absent from the delta graph", number),
        })
}

/// Merge delta communities into base communities.
///
/// `entity_mapping` and `relationship_mapping` come from the same merge pass;
/// every delta member must appear in them.
pub fn merge_communities(
    base: &[Community],
    delta: &[Community],
    entity_mapping: &IdMapping,
    relationship_mapping: &IdMapping,
) -> Result<CommunityMerge> {
    let mut merged: Vec<Community> = base.to_vec();
    let mut taken: BTreeSet<i64> = base.iter().map(|c| c.community).collect();
    let mut allocator = IdAllocator::new(base.iter().map(|c| c.id.as_str()));
    let mut mapping = BTreeMap::new();
    let mut id_mapping = IdMapping::new();
    let mut created: Vec<(usize, &Community)> = Vec::new();

    // Parents before children so absorbed parents are known
    let mut ordered: Vec<&Community> = delta.iter().collect();
    ordered.sort_by_key(|c| c.level);

    for community in ordered {
        if community.id.is_empty() {
            return Err(Error::MergeInputInconsistency {
                table: tables::COMMUNITIES.to_string(),
                key: community.community.to_string(),
                detail: "delta community has no id".to_string(),
            });
        }
        let entity_ids = remap_ids(community, &community.entity_ids, entity_mapping, "entity")?;
        let relationship_ids = remap_ids(
            community,
            &community.relationship_ids,
            relationship_mapping,
            "relationship",
        )?;

        let members: BTreeSet<&str> = entity_ids.iter().map(String::as_str).collect();
        let absorbing = merged.iter().take(base.len()).position(|candidate| {
            if candidate.level != community.level {
                return false;
            }
            // An empty membership is a subset of everything; never match on it
            let existing = member_set(candidate);
            !members.is_empty()
                && !existing.is_empty()
                && (members.is_subset(&existing) || existing.is_subset(&members))
        });

        let position = match absorbing {
            Some(position) => {
                let target = &mut merged[position];
                extend_unique(&mut target.entity_ids, entity_ids);
                extend_unique(&mut target.relationship_ids, relationship_ids);
                extend_unique(
                    &mut target.text_unit_ids,
                    community.text_unit_ids.iter().cloned(),
                );
                position
            }
            None => {
                let number = if taken.contains(&community.community) {
                    taken.last().map_or(0, |max| max + 1)
                } else {
                    community.community
                };
                taken.insert(number);

                let mut fresh = community.clone();
                fresh.id = allocator.allocate(&community.id, &format!("community:{}", number));
                if number != community.community {
                    fresh.community = number;
                    fresh.title = format!("Community {}", number);
                }
                fresh.entity_ids = entity_ids;
                fresh.relationship_ids = relationship_ids;
                merged.push(fresh);
                created.push((merged.len() - 1, community));
                merged.len() - 1
            }
        };

        mapping.insert(community.community, merged[position].community);
        id_mapping.insert(community.id.clone(), merged[position].id.clone());
    }

    // Rewire hierarchy of new communities now that every number is mapped
    for (position, original) in created {
        let parent = remap_number(original, original.parent, &mapping)?;
        let children = original
            .children
            .iter()
            .map(|child| remap_number(original, *child, &mapping))
            .collect::<Result<BTreeSet<_>>>()?;
        let target = &mut merged[position];
        target.parent = parent;
        target.children = children.into_iter().collect();
    }

    let links: Vec<(i64, i64)> = merged
        .iter()
        .filter(|c| c.parent >= 0)
        .map(|c| (c.parent, c.community))
        .collect();
    for (parent, child) in links {
        if let Some(p) = merged.iter_mut().find(|c| c.community == parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
    }

    for (index, community) in merged.iter_mut().enumerate() {
        community.human_readable_id = index as u64;
        community.size = community.entity_ids.len() as u64;
    }

    Ok(CommunityMerge {
        communities: merged,
        mapping,
        id_mapping,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(ids: &[&str]) -> IdMapping {
        let mut mapping = IdMapping::new();
        for id in ids {
            mapping.insert(*id, *id);
        }
        mapping
    }

    #[test]
    fn test_subset_absorbed_into_base() {
        let base = vec![Community::new("c0", 0, 0).with_entities(["1", "2", "3"])];
        let delta = vec![Community::new("d0", 0, 0).with_entities(["9"])];
        let mut entities = IdMapping::new();
        entities.insert("9", "2");

        let out = merge_communities(&base, &delta, &entities, &IdMapping::new()).unwrap();
        assert_eq!(out.communities.len(), 1);
        assert_eq!(out.mapping.get(&0), Some(&0));
        assert_eq!(out.id_mapping.get("d0"), Some("c0"));
    }

    #[test]
    fn test_superset_grows_base_community() {
        let base = vec![Community::new("c0", 0, 0).with_entities(["1"])];
        let delta = vec![Community::new("d0", 5, 0).with_entities(["1", "4"])];
        let out =
            merge_communities(&base, &delta, &identity(&["1", "4"]), &IdMapping::new()).unwrap();
        assert_eq!(out.communities.len(), 1);
        assert_eq!(out.communities[0].entity_ids, vec!["1", "4"]);
        assert_eq!(out.communities[0].size, 2);
        assert_eq!(out.mapping.get(&5), Some(&0));
    }

    #[test]
    fn test_disjoint_community_gets_fresh_number() {
        let base = vec![
            Community::new("c0", 0, 0).with_entities(["1"]),
            Community::new("c1", 1, 0).with_entities(["2"]),
        ];
        let delta = vec![Community::new("d0", 0, 0).with_entities(["3", "4"])];
        let out =
            merge_communities(&base, &delta, &identity(&["3", "4"]), &IdMapping::new()).unwrap();

        assert_eq!(out.communities.len(), 3);
        let fresh = &out.communities[2];
        assert_eq!(fresh.community, 2);
        assert_eq!(fresh.title, "Community 2");
        assert_eq!(fresh.human_readable_id, 2);
        assert_eq!(out.mapping.get(&0), Some(&2));
    }

    #[test]
    fn test_levels_do_not_absorb_each_other() {
        let base = vec![Community::new("c0", 0, 0).with_entities(["1", "2"])];
        let delta = vec![Community::new("d0", 7, 1).with_entities(["1"])];
        let out = merge_communities(&base, &delta, &identity(&["1"]), &IdMapping::new()).unwrap();
        assert_eq!(out.communities.len(), 2);
        assert_eq!(out.mapping.get(&7), Some(&7));
    }

    #[test]
    fn test_hierarchy_remapped() {
        let base = vec![Community::new("c0", 0, 0).with_entities(["1"])];
        let mut parent = Community::new("d0", 0, 0).with_entities(["5", "6"]);
        parent.children = vec![1];
        let mut child = Community::new("d1", 1, 1).with_entities(["5"]);
        child.parent = 0;

        let out = merge_communities(
            &base,
            &[child, parent],
            &identity(&["5", "6"]),
            &IdMapping::new(),
        )
        .unwrap();

        let new_parent = out.mapping[&0];
        let new_child = out.mapping[&1];
        assert_eq!(new_parent, 1);
        assert_eq!(new_child, 2);

        let child = out.communities.iter().find(|c| c.community == new_child).unwrap();
        assert_eq!(child.parent, new_parent);
        let parent = out.communities.iter().find(|c| c.community == new_parent).unwrap();
        assert_eq!(parent.children, vec![new_child]);
    }

    #[test]
    fn test_unknown_relationship_member_fails_loudly() {
        let mut delta = Community::new("d0", 0, 0).with_entities(["1"]);
        delta.relationship_ids = vec!["r404".into()];
        let err =
            merge_communities(&[], &[delta], &identity(&["1"]), &IdMapping::new()).unwrap_err();
        assert!(err.to_string().contains("r404"));
    }

    #[test]
    fn test_empty_delta_community_not_absorbed() {
        let base = vec![Community::new("c0", 0, 0).with_entities(["1"])];
        let delta = vec![Community::new("d0", 0, 0)];
        let out = merge_communities(&base, &delta, &IdMapping::new(), &IdMapping::new()).unwrap();

        assert_eq!(out.communities.len(), 2);
        assert_eq!(out.communities[0].entity_ids, vec!["1"]);
        assert_eq!(out.mapping.get(&0), Some(&1));
        assert_ne!(out.id_mapping.get("d0"), Some("c0"));
    }

    #[test]
    fn test_empty_base_community_does_not_absorb() {
        let base = vec![Community::new("c0", 0, 0)];
        let delta = vec![Community::new("d0", 0, 0).with_entities(["1", "2"])];
        let out =
            merge_communities(&base, &delta, &identity(&["1", "2"]), &IdMapping::new()).unwrap();

        assert_eq!(out.communities.len(), 2);
        assert!(out.communities[0].entity_ids.is_empty());
        assert_eq!(out.communities[1].entity_ids, vec!["1", "2"]);
        assert_eq!(out.mapping.get(&0), Some(&1));
    }

    #[test]
    fn test_empty_delta_is_identity() {
        let base = vec![Community::new("c0", 0, 0).with_entities(["1"])];
        let out = merge_communities(&base, &[], &IdMapping::new(), &IdMapping::new()).unwrap();
        assert_eq!(out.communities, base);
    }
}
