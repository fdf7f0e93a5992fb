//! Graph records
//!
//! Every table row maps onto one of these types. Column names follow the
//! persisted table schema (`type`, `human_readable_id`, ...).

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Table names
pub mod tables {
    pub const DOCUMENTS: &str = "documents";
    pub const TEXT_UNITS: &str = "text_units";
    pub const ENTITIES: &str = "entities";
    pub const RELATIONSHIPS: &str = "relationships";
    pub const COMMUNITIES: &str = "communities";
    pub const COVARIATES: &str = "covariates";
    pub const TYPE_PROPOSALS: &str = "type_proposals";
    pub const RAW_ENTITIES: &str = "raw_entities";
    pub const RAW_RELATIONSHIPS: &str = "raw_relationships";
}

fn one() -> u64 {
    1
}

fn one_f64() -> f64 {
    1.0
}

fn no_parent() -> i64 {
    -1
}

/// Accept either a single string or a list of strings
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    match OneOrMany::deserialize(deserializer) {
        Ok(OneOrMany::One(s)) if s.is_empty() => Ok(Vec::new()),
        Ok(OneOrMany::One(s)) => Ok(vec![s]),
        Ok(OneOrMany::Many(v)) => Ok(v),
        Ok(OneOrMany::Null(())) => Ok(Vec::new()),
        Err(_) => Err(de::Error::custom("expected a string or a list of strings")),
    }
}

/// Append `items` to `target`, skipping values already present
pub fn extend_unique(target: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

/// A source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub human_readable_id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub text_unit_ids: Vec<String>,
}

/// A chunk of document text that extraction runs over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    #[serde(default)]
    pub human_readable_id: u64,
    pub text: String,
    #[serde(default)]
    pub document_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_tokens: Option<u64>,
}

/// A graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier assigned at creation
    pub id: String,
    /// Dense sequence number, reassigned on every output
    #[serde(default)]
    pub human_readable_id: u64,
    pub title: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub description: Vec<String>,
    #[serde(default)]
    pub text_unit_ids: Vec<String>,
    #[serde(default = "one")]
    pub frequency: u64,
    #[serde(default)]
    pub degree: u64,
}

impl Entity {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            human_readable_id: 0,
            title: title.into(),
            entity_type: String::new(),
            description: Vec::new(),
            text_unit_ids: Vec::new(),
            frequency: 1,
            degree: 0,
        }
    }

    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description.push(description.into());
        self
    }

    pub fn with_frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_text_units<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_unit_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// A directed graph edge between two entity titles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(default)]
    pub human_readable_id: u64,
    pub source: String,
    pub target: String,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub description: Vec<String>,
    #[serde(default = "one_f64")]
    pub weight: f64,
    #[serde(default)]
    pub text_unit_ids: Vec<String>,
    #[serde(default)]
    pub combined_degree: u64,
}

impl Relationship {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            human_readable_id: 0,
            source: source.into(),
            target: target.into(),
            description: Vec::new(),
            weight: 1.0,
            text_unit_ids: Vec::new(),
            combined_degree: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description.push(description.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_text_units<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_unit_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// A cluster of entities produced by an external clustering step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    #[serde(default)]
    pub human_readable_id: u64,
    /// Community number, unique across levels
    pub community: i64,
    #[serde(default)]
    pub level: u32,
    #[serde(default = "no_parent")]
    pub parent: i64,
    #[serde(default)]
    pub children: Vec<i64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub relationship_ids: Vec<String>,
    #[serde(default)]
    pub text_unit_ids: Vec<String>,
    /// Creation date (ISO-8601)
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub size: u64,
}

impl Community {
    pub fn new(id: impl Into<String>, community: i64, level: u32) -> Self {
        Self {
            id: id.into(),
            human_readable_id: 0,
            community,
            level,
            parent: -1,
            children: Vec::new(),
            title: format!("Community {}", community),
            entity_ids: Vec::new(),
            relationship_ids: Vec::new(),
            text_unit_ids: Vec::new(),
            period: String::new(),
            size: 0,
        }
    }

    pub fn with_entities<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = ids.into_iter().map(Into::into).collect();
        self.size = self.entity_ids.len() as u64;
        self
    }
}

/// An auxiliary claim extracted from a text unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    pub id: String,
    #[serde(default)]
    pub human_readable_id: u64,
    #[serde(default = "default_covariate_type")]
    pub covariate_type: String,
    #[serde(rename = "type", default)]
    pub claim_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub subject_id: String,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub source_text: Option<String>,
    pub text_unit_id: String,
}

fn default_covariate_type() -> String {
    "claim".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_description_accepts_string_or_list() {
        let single: Entity =
            serde_json::from_value(json!({"id": "1", "title": "A", "description": "one"})).unwrap();
        assert_eq!(single.description, vec!["one"]);
        assert_eq!(single.frequency, 1);

        let many: Entity = serde_json::from_value(
            json!({"id": "1", "title": "A", "description": ["one", "two"], "type": "person"}),
        )
        .unwrap();
        assert_eq!(many.description, vec!["one", "two"]);
        assert_eq!(many.entity_type, "person");

        let none: Entity =
            serde_json::from_value(json!({"id": "1", "title": "A", "description": null})).unwrap();
        assert!(none.description.is_empty());
    }

    #[test]
    fn test_entity_serializes_type_column() {
        let value = serde_json::to_value(Entity::new("1", "A").with_type("org")).unwrap();
        assert_eq!(value["type"], "org");
        assert!(value.get("entity_type").is_none());
    }

    #[test]
    fn test_community_defaults() {
        let c: Community = serde_json::from_value(json!({"id": "c", "community": 3})).unwrap();
        assert_eq!(c.parent, -1);
        assert_eq!(c.level, 0);
        assert!(c.children.is_empty());
    }

    #[test]
    fn test_extend_unique_keeps_first_occurrence() {
        let mut v = vec!["a".to_string(), "b".to_string()];
        extend_unique(&mut v, ["b".to_string(), "c".to_string(), "a".to_string()]);
        assert_eq!(v, vec!["a", "b", "c"]);
    }
}
