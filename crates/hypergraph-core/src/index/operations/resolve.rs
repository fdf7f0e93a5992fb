//! Entity resolution: fold duplicate names into one entity
//!
//! Entities are asked about one type at a time. The model answers with
//! groups of names; every name after the first folds into the first.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::graph::{Entity, Relationship, extend_unique};
use crate::index::parse::parse_resolution_groups;
use crate::index::prompts::{delimiters, render};
use crate::llm::{CompletionRequest, LlmCompletion};

use super::extract::relationship_id;

/// Alias title -> canonical title
pub type TitleAliases = BTreeMap<String, String>;

/// Keep only groups naming known titles of this batch; a title joins at most one group
pub fn aliases_from_groups(groups: Vec<Vec<String>>, known: &HashSet<&str>) -> TitleAliases {
    let mut aliases = TitleAliases::new();
    let mut claimed: HashSet<String> = HashSet::new();
    for group in groups {
        let mut members = group
            .into_iter()
            .filter(|name| known.contains(name.as_str()) && !claimed.contains(name))
            .collect::<Vec<_>>()
            .into_iter();
        let Some(canonical) = members.next() else {
            continue;
        };
        let mut folded = false;
        for alias in members {
            if alias != canonical && claimed.insert(alias.clone()) {
                aliases.insert(alias, canonical.clone());
                folded = true;
            }
        }
        if folded {
            claimed.insert(canonical);
        }
    }
    aliases
}

/// Merge alias entities into their canonical entity and rewrite relationship
/// endpoints. Relationships that collapse onto one pair are merged; ones that
/// become self-loops are dropped.
pub fn fold_aliases(
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    aliases: &TitleAliases,
) -> (Vec<Entity>, Vec<Relationship>) {
    if aliases.is_empty() {
        return (entities, relationships);
    }
    let resolve = |title: &str| aliases.get(title).cloned().unwrap_or_else(|| title.to_string());

    let mut folded: Vec<Entity> = Vec::with_capacity(entities.len());
    let mut by_title: HashMap<String, usize> = HashMap::new();
    let (canonical, alias): (Vec<Entity>, Vec<Entity>) = entities
        .into_iter()
        .partition(|e| !aliases.contains_key(&e.title));
    for entity in canonical {
        by_title.insert(entity.title.clone(), folded.len());
        folded.push(entity);
    }
    for entity in alias {
        let target = resolve(&entity.title);
        match by_title.get(&target) {
            Some(&position) => {
                let into = &mut folded[position];
                into.frequency += entity.frequency;
                extend_unique(&mut into.description, entity.description);
                extend_unique(&mut into.text_unit_ids, entity.text_unit_ids);
            }
            None => {
                // Canonical name was not among the entities; keep the alias as is
                by_title.insert(entity.title.clone(), folded.len());
                folded.push(entity);
            }
        }
    }

    let mut merged: Vec<Relationship> = Vec::with_capacity(relationships.len());
    let mut by_pair: HashMap<(String, String), usize> = HashMap::new();
    let mut self_loops = 0usize;
    for mut relationship in relationships {
        let source = resolve(&relationship.source);
        let target = resolve(&relationship.target);
        if source == target {
            self_loops += 1;
            continue;
        }
        if source != relationship.source || target != relationship.target {
            relationship.id = relationship_id(&source, &target);
            relationship.source = source;
            relationship.target = target;
        }

        let key = (relationship.source.clone(), relationship.target.clone());
        match by_pair.get(&key) {
            Some(&position) => {
                let into = &mut merged[position];
                into.weight += relationship.weight;
                extend_unique(&mut into.description, relationship.description);
                extend_unique(&mut into.text_unit_ids, relationship.text_unit_ids);
            }
            None => {
                by_pair.insert(key, merged.len());
                merged.push(relationship);
            }
        }
    }
    if self_loops > 0 {
        debug!(self_loops, "Dropped relationships between resolved aliases");
    }
    (folded, merged)
}

/// Asks the model which entity names are duplicates
#[derive(Debug, Clone)]
pub struct EntityResolver<'a> {
    pub gateway: &'a LlmCompletion,
    pub prompt: &'a str,
    pub concurrency: usize,
}

impl EntityResolver<'_> {
    async fn resolve_type(
        &self,
        entity_type: &str,
        titles: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<TitleAliases> {
        let entity_list = titles.join("\n");
        let mut values: Vec<(&str, &str)> = delimiters().to_vec();
        values.push(("entity_type", entity_type));
        values.push(("entity_list", &entity_list));
        let response = self
            .gateway
            .complete(
                CompletionRequest::prompt(render(self.prompt, &values))
                    .with_operation("resolve_entities"),
                cancel,
            )
            .await?;

        let known: HashSet<&str> = titles.iter().map(String::as_str).collect();
        Ok(aliases_from_groups(
            parse_resolution_groups(&response.content),
            &known,
        ))
    }

    /// Resolve duplicates among `entities` and fold them
    pub async fn run(
        &self,
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Entity>, Vec<Relationship>)> {
        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entity in &entities {
            by_type
                .entry(entity.entity_type.clone())
                .or_default()
                .push(entity.title.clone());
        }
        let batches: Vec<(String, Vec<String>)> = by_type
            .into_iter()
            .filter(|(_, titles)| titles.len() > 1)
            .collect();

        let resolved: Vec<TitleAliases> = stream::iter(batches)
            .map(|(entity_type, titles)| async move {
                self.resolve_type(&entity_type, titles, cancel).await
            })
            .buffered(self.concurrency.max(1))
            .boxed()
            .try_collect()
            .await?;
        let aliases: TitleAliases = resolved.into_iter().flatten().collect();

        let before = entities.len();
        let (entities, relationships) = fold_aliases(entities, relationships, &aliases);
        info!(
            aliases = aliases.len(),
            entities_before = before,
            entities_after = entities.len(),
            "Resolved duplicate entities"
        );
        Ok((entities, relationships))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::Cache;
    use crate::config::ModelConfig;
    use crate::index::prompts::RESOLVE_ENTITIES_PROMPT;
    use crate::llm::{MetricsStore, MockProvider, Registries, create_completion};

    fn entity(title: &str, entity_type: &str, description: &str, unit: &str) -> Entity {
        let mut entity = Entity::new(format!("id-{}", title), title);
        entity.entity_type = entity_type.to_string();
        entity.description = vec![description.to_string()];
        entity.text_unit_ids = vec![unit.to_string()];
        entity
    }

    fn relationship(source: &str, target: &str, weight: f64) -> Relationship {
        let mut relationship =
            Relationship::new(relationship_id(source, target), source, target).with_weight(weight);
        relationship.description = vec![format!("{} -> {}", source, target)];
        relationship
    }

    fn aliases(pairs: &[(&str, &str)]) -> TitleAliases {
        pairs
            .iter()
            .map(|(a, c)| (a.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_groups_limited_to_known_titles() {
        let known: HashSet<&str> = ["ROBERT SMITH", "BOB SMITH", "ACME"].into_iter().collect();
        let groups = vec![
            vec!["ROBERT SMITH".into(), "BOB SMITH".into(), "R. SMITH".into()],
            // BOB SMITH is already claimed; nothing left to fold
            vec!["BOB SMITH".into(), "ROBERT SMITH".into()],
            vec!["ACME".into(), "ACME CORP".into()],
        ];
        assert_eq!(
            aliases_from_groups(groups, &known),
            aliases(&[("BOB SMITH", "ROBERT SMITH")])
        );
    }

    #[test]
    fn test_fold_merges_entities_and_relationships() {
        let entities = vec![
            entity("ROBERT SMITH", "PERSON", "An engineer", "t1"),
            entity("ACME", "ORGANIZATION", "A company", "t1"),
            entity("BOB SMITH", "PERSON", "Likes tea", "t2"),
        ];
        let relationships = vec![
            relationship("ROBERT SMITH", "ACME", 2.0),
            relationship("BOB SMITH", "ACME", 3.0),
            relationship("BOB SMITH", "ROBERT SMITH", 1.0),
        ];

        let (entities, relationships) = fold_aliases(
            entities,
            relationships,
            &aliases(&[("BOB SMITH", "ROBERT SMITH")]),
        );

        assert_eq!(entities.len(), 2);
        let robert = &entities[0];
        assert_eq!(robert.title, "ROBERT SMITH");
        assert_eq!(robert.id, "id-ROBERT SMITH");
        assert_eq!(robert.frequency, 2);
        assert_eq!(robert.description, vec!["An engineer", "Likes tea"]);
        assert_eq!(robert.text_unit_ids, vec!["t1", "t2"]);

        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0].weight, 5.0);
        assert_eq!(relationships[0].id, relationship_id("ROBERT SMITH", "ACME"));
        assert_eq!(relationships[0].description.len(), 2);
    }

    #[tokio::test]
    async fn test_resolver_asks_once_per_type_with_duplicates() {
        let provider = Arc::new(MockProvider::with_responder(|request, _| {
            let prompt = &request.messages[0].content;
            assert!(prompt.contains("of type PERSON"));
            Ok("(ROBERT SMITH<|>BOB SMITH)<|COMPLETE|>".to_string())
        }));
        let gateway = create_completion(
            "entity_resolution",
            &ModelConfig {
                provider: "mock".into(),
                ..ModelConfig::default()
            },
            provider.clone(),
            &Cache::memory(),
            &MetricsStore::default(),
            &Registries::default(),
        )
        .unwrap();
        let resolver = EntityResolver {
            gateway: &gateway,
            prompt: RESOLVE_ENTITIES_PROMPT,
            concurrency: 2,
        };

        let (entities, relationships) = resolver
            .run(
                vec![
                    entity("ROBERT SMITH", "PERSON", "An engineer", "t1"),
                    entity("BOB SMITH", "PERSON", "Likes tea", "t2"),
                    entity("ACME", "ORGANIZATION", "A company", "t1"),
                ],
                vec![relationship("BOB SMITH", "ACME", 1.0)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // ORGANIZATION has a single entity and is not sent to the model
        assert_eq!(provider.calls(), 1);
        assert_eq!(entities.len(), 2);
        assert_eq!(relationships[0].source, "ROBERT SMITH");
    }
}
