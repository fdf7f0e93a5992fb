//! Graph extraction over text units

use std::collections::HashMap;

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{Entity, Relationship, TextUnit, extend_unique};
use crate::index::parse::{ExtractedEntity, ExtractedRelationship, parse_graph_records};
use crate::index::prompts::{CONTINUE_PROMPT, LOOP_PROMPT};
use crate::llm::{CompletionRequest, LlmCompletion, Message};

/// Stable id of an extracted entity
pub fn entity_id(title: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("entity:{}", title).as_bytes()).to_string()
}

/// Stable id of an extracted relationship
pub fn relationship_id(source: &str, target: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("relationship:{}->{}", source, target).as_bytes(),
    )
    .to_string()
}

/// Prompt once, then keep asking for missed records up to `max_gleanings`
/// times while the model answers `Y` to the loop check.
pub async fn gleaned_completion(
    gateway: &LlmCompletion,
    prompt: String,
    max_gleanings: u32,
    operation: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut messages = vec![Message::user(prompt)];
    let first = gateway
        .complete(
            CompletionRequest::new(messages.clone()).with_operation(operation),
            cancel,
        )
        .await?;
    let mut results = first.content.clone();
    messages.push(Message::assistant(first.content));

    for round in 0..max_gleanings {
        messages.push(Message::user(CONTINUE_PROMPT));
        let more = gateway
            .complete(
                CompletionRequest::new(messages.clone()).with_operation(operation),
                cancel,
            )
            .await?;
        results.push_str(&more.content);
        messages.push(Message::assistant(more.content));

        if round + 1 >= max_gleanings {
            break;
        }

        messages.push(Message::user(LOOP_PROMPT));
        let check = gateway
            .complete(
                CompletionRequest::new(messages.clone())
                    .with_operation(operation)
                    .with_max_tokens(1),
                cancel,
            )
            .await?;
        messages.pop();
        if !check.content.trim().to_uppercase().starts_with('Y') {
            debug!(round, "Gleaning loop check answered no");
            break;
        }
    }
    Ok(results)
}

/// Group extracted entity records by title.
///
/// The type is the most frequent one observed (first seen wins ties);
/// descriptions and text units are deduplicated in observation order.
pub fn group_entities(records: Vec<ExtractedEntity>) -> Vec<Entity> {
    let mut entities: Vec<Entity> = Vec::new();
    let mut type_counts: Vec<Vec<(String, u64)>> = Vec::new();
    let mut by_title: HashMap<String, usize> = HashMap::new();

    for record in records {
        let position = *by_title.entry(record.title.clone()).or_insert_with(|| {
            let mut entity = Entity::new(entity_id(&record.title), record.title.clone());
            entity.frequency = 0;
            entities.push(entity);
            type_counts.push(Vec::new());
            entities.len() - 1
        });

        let entity = &mut entities[position];
        entity.frequency += 1;
        if !record.description.is_empty() {
            extend_unique(&mut entity.description, [record.description]);
        }
        extend_unique(&mut entity.text_unit_ids, [record.source_id]);

        if !record.entity_type.is_empty() {
            let counts = &mut type_counts[position];
            match counts.iter_mut().find(|(t, _)| *t == record.entity_type) {
                Some((_, n)) => *n += 1,
                None => counts.push((record.entity_type, 1)),
            }
        }
    }

    for (entity, counts) in entities.iter_mut().zip(type_counts) {
        let mut best: Option<(String, u64)> = None;
        for (label, n) in counts {
            if best.as_ref().is_none_or(|(_, top)| n > *top) {
                best = Some((label, n));
            }
        }
        entity.entity_type = best.map(|(label, _)| label).unwrap_or_default();
    }
    for (index, entity) in entities.iter_mut().enumerate() {
        entity.human_readable_id = index as u64;
    }
    entities
}

/// Group extracted relationship records by `(source, target)`; weights add up
pub fn group_relationships(records: Vec<ExtractedRelationship>) -> Vec<Relationship> {
    let mut relationships: Vec<Relationship> = Vec::new();
    let mut by_pair: HashMap<(String, String), usize> = HashMap::new();

    for record in records {
        let key = (record.source.clone(), record.target.clone());
        match by_pair.get(&key) {
            Some(&position) => {
                let relationship = &mut relationships[position];
                relationship.weight += record.weight;
                if !record.description.is_empty() {
                    extend_unique(&mut relationship.description, [record.description]);
                }
                extend_unique(&mut relationship.text_unit_ids, [record.source_id]);
            }
            None => {
                let mut relationship = Relationship::new(
                    relationship_id(&record.source, &record.target),
                    record.source,
                    record.target,
                )
                .with_weight(record.weight)
                .with_text_units([record.source_id]);
                if !record.description.is_empty() {
                    relationship.description.push(record.description);
                }
                relationships.push(relationship);
                by_pair.insert(key, relationships.len() - 1);
            }
        }
    }
    for (index, relationship) in relationships.iter_mut().enumerate() {
        relationship.human_readable_id = index as u64;
    }
    relationships
}

/// Settings for one extraction pass
#[derive(Debug, Clone)]
pub struct GraphExtraction<'a> {
    pub gateway: &'a LlmCompletion,
    /// Rendered template with `{input_text}` still in place
    pub prompt: &'a str,
    pub max_gleanings: u32,
    pub concurrency: usize,
}

impl GraphExtraction<'_> {
    /// Extract and group entities and relationships from every text unit.
    ///
    /// Units run concurrently up to `concurrency`; results are assembled in
    /// input order so grouping is deterministic.
    pub async fn run(
        &self,
        text_units: &[TextUnit],
        cancel: &CancellationToken,
    ) -> Result<(Vec<Entity>, Vec<Relationship>)> {
        let per_unit: Vec<(Vec<ExtractedEntity>, Vec<ExtractedRelationship>)> =
            stream::iter(text_units)
                .map(|unit| async move {
                    let prompt = self.prompt.replace("{input_text}", &unit.text);
                    let output = gleaned_completion(
                        self.gateway,
                        prompt,
                        self.max_gleanings,
                        "extract_graph",
                        cancel,
                    )
                    .await?;
                    Ok::<_, crate::error::Error>(parse_graph_records(&output, &unit.id))
                })
                .buffered(self.concurrency.max(1))
                .boxed()
                .try_collect()
                .await?;

        let (entity_records, relationship_records): (Vec<_>, Vec<_>) =
            per_unit.into_iter().unzip();
        let entities = group_entities(entity_records.into_iter().flatten().collect());
        let relationships = group_relationships(relationship_records.into_iter().flatten().collect());

        info!(
            text_units = text_units.len(),
            entities = entities.len(),
            relationships = relationships.len(),
            "Extracted graph"
        );
        Ok((entities, relationships))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(title: &str, entity_type: &str, description: &str, source: &str) -> ExtractedEntity {
        ExtractedEntity {
            title: title.into(),
            entity_type: entity_type.into(),
            description: description.into(),
            source_id: source.into(),
        }
    }

    fn relationship(source: &str, target: &str, description: &str, unit: &str) -> ExtractedRelationship {
        ExtractedRelationship {
            source: source.into(),
            target: target.into(),
            description: description.into(),
            weight: 2.0,
            source_id: unit.into(),
        }
    }

    #[test]
    fn test_group_entities_by_title() {
        let grouped = group_entities(vec![
            entity("ALICE", "PERSON", "engineer", "t1"),
            entity("ACME", "ORGANIZATION", "maker", "t1"),
            entity("ALICE", "ORGANIZATION", "engineer", "t2"),
            entity("ALICE", "PERSON", "lives in Paris", "t2"),
        ]);

        assert_eq!(grouped.len(), 2);
        let alice = &grouped[0];
        assert_eq!(alice.frequency, 3);
        assert_eq!(alice.entity_type, "PERSON");
        assert_eq!(alice.description, vec!["engineer", "lives in Paris"]);
        assert_eq!(alice.text_unit_ids, vec!["t1", "t2"]);
        assert_eq!(alice.id, entity_id("ALICE"));
        assert_eq!(grouped[1].human_readable_id, 1);
    }

    #[test]
    fn test_group_relationships_sums_weight() {
        let grouped = group_relationships(vec![
            relationship("A", "B", "d1", "t1"),
            relationship("A", "B", "d2", "t2"),
            relationship("B", "A", "d3", "t2"),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].weight, 4.0);
        assert_eq!(grouped[0].description, vec!["d1", "d2"]);
        assert_eq!(grouped[0].id, relationship_id("A", "B"));
        assert_ne!(grouped[0].id, grouped[1].id);
    }
}
