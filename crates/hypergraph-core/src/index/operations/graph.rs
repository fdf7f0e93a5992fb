//! Graph finalization and pruning

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::config::PruneGraphConfig;
use crate::error::{Error, Result};
use crate::graph::{Entity, Relationship};

/// Number of distinct neighbours of every node; self-loops are ignored
pub fn node_degrees(relationships: &[Relationship]) -> HashMap<String, u64> {
    let mut neighbours: HashMap<&str, HashSet<&str>> = HashMap::new();
    for relationship in relationships {
        if relationship.source == relationship.target {
            continue;
        }
        neighbours
            .entry(&relationship.source)
            .or_default()
            .insert(&relationship.target);
        neighbours
            .entry(&relationship.target)
            .or_default()
            .insert(&relationship.source);
    }
    neighbours
        .into_iter()
        .map(|(node, set)| (node.to_string(), set.len() as u64))
        .collect()
}

/// Compute degrees and renumber `human_readable_id` densely
pub fn finalize_graph(entities: &mut [Entity], relationships: &mut [Relationship]) {
    let degrees = node_degrees(relationships);
    let degree_of = |title: &str| degrees.get(title).copied().unwrap_or(0);

    for (index, entity) in entities.iter_mut().enumerate() {
        entity.human_readable_id = index as u64;
        entity.degree = degree_of(&entity.title);
    }
    for (index, relationship) in relationships.iter_mut().enumerate() {
        relationship.human_readable_id = index as u64;
        relationship.combined_degree = degree_of(&relationship.source) + degree_of(&relationship.target);
    }
}

/// Value at percentile `pct` (0-100) with linear interpolation
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

fn retain_connected(entities: &[Entity], relationships: &mut Vec<Relationship>) {
    let titles: HashSet<&str> = entities.iter().map(|e| e.title.as_str()).collect();
    relationships.retain(|r| titles.contains(r.source.as_str()) && titles.contains(r.target.as_str()));
}

/// Remove rare nodes, weak edges and poorly connected nodes.
///
/// Fails when nothing remains of either table.
pub fn prune_graph(
    mut entities: Vec<Entity>,
    mut relationships: Vec<Relationship>,
    config: &PruneGraphConfig,
) -> Result<(Vec<Entity>, Vec<Relationship>)> {
    let (entities_before, relationships_before) = (entities.len(), relationships.len());

    entities.retain(|e| e.frequency >= config.min_node_freq);
    retain_connected(&entities, &mut relationships);

    let weights: Vec<f64> = relationships.iter().map(|r| r.weight).collect();
    if let Some(threshold) = percentile(&weights, config.min_edge_weight_pct) {
        relationships.retain(|r| r.weight >= threshold);
    }

    let degrees = node_degrees(&relationships);
    entities.retain(|e| degrees.get(&e.title).copied().unwrap_or(0) >= config.min_node_degree);
    retain_connected(&entities, &mut relationships);

    info!(
        entities_before,
        entities_after = entities.len(),
        relationships_before,
        relationships_after = relationships.len(),
        "Pruned graph"
    );

    if entities.is_empty() {
        return Err(Error::EmptyPruneResult {
            table: "entities".to_string(),
        });
    }
    if relationships.is_empty() {
        return Err(Error::EmptyPruneResult {
            table: "relationships".to_string(),
        });
    }
    Ok((entities, relationships))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(source: &str, target: &str, weight: f64) -> Relationship {
        Relationship::new(format!("{}-{}", source, target), source, target).with_weight(weight)
    }

    fn node(title: &str, frequency: u64) -> Entity {
        Entity::new(title.to_lowercase(), title).with_frequency(frequency)
    }

    #[test]
    fn test_finalize_counts_distinct_neighbours() {
        let mut entities = vec![node("A", 1), node("B", 1), node("C", 1)];
        let mut relationships = vec![rel("A", "B", 1.0), rel("B", "A", 1.0), rel("B", "C", 1.0)];
        finalize_graph(&mut entities, &mut relationships);

        assert_eq!(entities[0].degree, 1);
        assert_eq!(entities[1].degree, 2);
        assert_eq!(relationships[2].combined_degree, 3);
        assert_eq!(relationships[2].human_readable_id, 2);
    }

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 50.0), Some(3.0));
        assert_eq!(percentile(&[1.0, 2.0], 50.0), Some(1.5));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_prune_drops_rare_nodes_and_weak_edges() {
        let entities = vec![node("A", 3), node("B", 3), node("C", 3), node("RARE", 1)];
        let relationships = vec![
            rel("A", "B", 10.0),
            rel("B", "C", 1.0),
            rel("A", "RARE", 10.0),
        ];
        let config = PruneGraphConfig {
            enabled: true,
            min_node_freq: 2,
            min_node_degree: 1,
            min_edge_weight_pct: 50.0,
        };

        let (entities, relationships) = prune_graph(entities, relationships, &config).unwrap();
        let titles: Vec<_> = entities.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
        assert_eq!(relationships.len(), 1);
    }

    #[test]
    fn test_prune_to_nothing_fails() {
        let config = PruneGraphConfig {
            enabled: true,
            min_node_freq: 100,
            ..PruneGraphConfig::default()
        };
        let err = prune_graph(vec![node("A", 1)], vec![rel("A", "A", 1.0)], &config).unwrap_err();
        assert!(matches!(err, Error::EmptyPruneResult { table } if table == "entities"));
    }
}
