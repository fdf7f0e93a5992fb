//! Delimited-tuple parsing of model output
//!
//! Extraction prompts ask for records like
//! `("entity"<|>NAME<|>TYPE<|>DESCRIPTION)` separated by `##` and
//! terminated by `<|COMPLETE|>`. Parsing is lenient: malformed records are
//! skipped and records may also be separated by newlines.

pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

/// Trim whitespace and quotes, drop control characters
pub fn clean_str(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_control()).collect();
    cleaned.trim().trim_matches('"').trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub title: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub description: String,
    pub weight: f64,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedClaim {
    pub subject: String,
    pub object: Option<String>,
    pub claim_type: String,
    pub status: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub description: String,
    pub source_text: String,
}

/// Split model output into records of cleaned fields
fn records(text: &str) -> Vec<Vec<String>> {
    let text = text.replace(COMPLETION_DELIMITER, "");
    text.split(RECORD_DELIMITER)
        .flat_map(str::lines)
        .filter_map(|line| {
            let line = line.trim();
            let line = line.strip_prefix('(').unwrap_or(line);
            let line = line.strip_suffix(')').unwrap_or(line);
            if line.trim().is_empty() {
                return None;
            }
            Some(line.split(TUPLE_DELIMITER).map(clean_str).collect())
        })
        .collect()
}

fn optional(value: &str) -> Option<String> {
    let value = clean_str(value);
    (!value.is_empty() && !value.eq_ignore_ascii_case("none")).then_some(value)
}

/// Entities and relationships found in one extraction response
pub fn parse_graph_records(
    text: &str,
    source_id: &str,
) -> (Vec<ExtractedEntity>, Vec<ExtractedRelationship>) {
    let mut entities = Vec::new();
    let mut relationships = Vec::new();

    for fields in records(text) {
        let Some(kind) = fields.first() else {
            continue;
        };
        match kind.to_lowercase().as_str() {
            "entity" if fields.len() >= 4 => {
                let title = fields[1].to_uppercase();
                if title.is_empty() {
                    continue;
                }
                entities.push(ExtractedEntity {
                    title,
                    entity_type: fields[2].to_uppercase(),
                    description: fields[3].clone(),
                    source_id: source_id.to_string(),
                });
            }
            "relationship" if fields.len() >= 4 => {
                let source = fields[1].to_uppercase();
                let target = fields[2].to_uppercase();
                if source.is_empty() || target.is_empty() {
                    continue;
                }
                let weight = fields
                    .get(4)
                    .and_then(|w| w.parse::<f64>().ok())
                    .filter(|w| w.is_finite())
                    .unwrap_or(1.0);
                relationships.push(ExtractedRelationship {
                    source,
                    target,
                    description: fields[3].clone(),
                    weight,
                    source_id: source_id.to_string(),
                });
            }
            _ => {}
        }
    }
    (entities, relationships)
}

/// Claims found in one claim-extraction response
pub fn parse_claim_records(text: &str) -> Vec<ExtractedClaim> {
    records(text)
        .into_iter()
        .filter(|fields| fields.len() >= 8 && !fields[0].is_empty())
        .map(|fields| ExtractedClaim {
            subject: fields[0].to_uppercase(),
            object: optional(&fields[1]).map(|o| o.to_uppercase()),
            claim_type: fields[2].to_uppercase(),
            status: fields[3].to_uppercase(),
            start_date: optional(&fields[4]),
            end_date: optional(&fields[5]),
            description: fields[6].clone(),
            source_text: fields[7].clone(),
        })
        .collect()
}

/// Groups of names the model says denote one entity, canonical name first
pub fn parse_resolution_groups(text: &str) -> Vec<Vec<String>> {
    records(text)
        .into_iter()
        .map(|fields| {
            fields
                .into_iter()
                .map(|name| name.to_uppercase())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|names| names.len() >= 2)
        .collect()
}
