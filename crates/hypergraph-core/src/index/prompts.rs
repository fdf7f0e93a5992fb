//! Prompt templates
//!
//! Templates use `{name}` placeholders filled by [`render`]. Any template can
//! be replaced by a file named in the workflow's `prompt` setting.

use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};

use super::parse::{COMPLETION_DELIMITER, RECORD_DELIMITER, TUPLE_DELIMITER};

pub const EXTRACT_GRAPH_PROMPT: &str = r#"-Goal-
Given a text document and a list of entity types, identify all entities of those types in the text and all relationships among the identified entities.

-Steps-
1. Identify all entities. For each entity, extract:
- entity_name: name of the entity, capitalized
- entity_type: one of the following types: [{entity_types}]
- entity_description: comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>)

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are clearly related. For each pair, extract:
- source_entity: name of the source entity, as identified in step 1
- target_entity: name of the target entity, as identified in step 1
- relationship_description: "<relationship_label>: <explanation>", where the label is one of [{relationship_types}] when that list is not empty
- relationship_strength: a numeric score indicating the strength of the relationship
Format each relationship as ("relationship"{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_description>{tuple_delimiter}<relationship_strength>)

3. Return output as a single list of all entities and relationships. Use **{record_delimiter}** as the list delimiter.

4. When finished, output {completion_delimiter}
{ontology}
-Real Data-
entity_types: {entity_types}
text: {input_text}
output:"#;

pub const CONTINUE_PROMPT: &str = "MANY entities and relationships were missed in the last extraction. Remember to ONLY emit entities that match any of the previously extracted types. Add them below using the same format:\n";

pub const LOOP_PROMPT: &str = "It appears some entities and relationships may have still been missed. Answer Y if there are still entities or relationships that need to be added, or N if there are none. Please answer with a single letter Y or N.\n";

pub const SUMMARIZE_PROMPT: &str = r#"You are a helpful assistant responsible for generating a comprehensive summary of the data provided below.
Given one or more entities, and a list of descriptions, all related to the same entity or group of entities, concatenate all of these into a single, comprehensive description. Make sure to include information collected from all the descriptions.
If the provided descriptions are contradictory, resolve the contradictions and provide a single, coherent summary.
Make sure it is written in third person, and include the entity names so we have the full context.
Limit the final description length to {max_length} words.

#######
-Data-
Entities: {entity_name}
Description List: {description_list}
#######
Output:"#;

pub const RESOLVE_ENTITIES_PROMPT: &str = r#"-Goal-
You are given a list of entity names of type {entity_type} extracted from a set of documents. Some names refer to the same real-world entity (abbreviations, alternate spellings, with or without titles or suffixes). Group the names that refer to the same entity.

-Steps-
1. Only group names that certainly refer to the same entity. Leave every other name out of the output.
2. For each group, put the most complete name first, followed by every other name in the group, exactly as written in the list.
Format each group as (<name>{tuple_delimiter}<name>{tuple_delimiter}...)
3. Use **{record_delimiter}** as the list delimiter. When finished, output {completion_delimiter}

-Names-
{entity_list}
Output:"#;

pub const EXTRACT_CLAIMS_PROMPT: &str = r#"-Target activity-
You are an intelligent assistant that helps a human analyst to analyze claims against certain entities presented in a text document.

-Goal-
Given a text document, an entity specification, and a claim description, extract all entities that match the entity specification and all claims against those entities.

-Steps-
1. Extract all named entities that match the entity specification: {entity_specs}
2. For each entity identified in step 1, extract all claims associated with the entity. Claims need to match the specified claim description: {claim_description}
For each claim, extract:
- Subject: name of the entity that is subject of the claim, capitalized
- Object: name of the entity that is object of the claim, capitalized, or NONE
- Claim Type: overall category of the claim, capitalized
- Claim Status: TRUE, FALSE, or SUSPECTED
- Claim Start Date: ISO-8601 start date, or NONE
- Claim End Date: ISO-8601 end date, or NONE
- Claim Description: detailed description explaining the reasoning behind the claim
- Claim Source Text: list of all quotes from the original text that are relevant to the claim
Format each claim as (<subject_entity>{tuple_delimiter}<object_entity>{tuple_delimiter}<claim_type>{tuple_delimiter}<claim_status>{tuple_delimiter}<claim_start_date>{tuple_delimiter}<claim_end_date>{tuple_delimiter}<claim_description>{tuple_delimiter}<claim_source>)

3. Return output as a single list of all the claims. Use **{record_delimiter}** as the list delimiter.

4. When finished, output {completion_delimiter}

-Real Data-
Entity specification: {entity_specs}
Claim description: {claim_description}
Text: {input_text}
Output:"#;

/// Fill `{key}` placeholders; unknown placeholders are left in place
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("{{{}}}", key), value);
    }
    rendered
}

/// Delimiter placeholders shared by every extraction template
pub fn delimiters() -> [(&'static str, &'static str); 3] {
    [
        ("tuple_delimiter", TUPLE_DELIMITER),
        ("record_delimiter", RECORD_DELIMITER),
        ("completion_delimiter", COMPLETION_DELIMITER),
    ]
}

/// The template at `path` (relative to the project root), or `default`
pub async fn resolve_prompt(
    config: &Config,
    path: Option<&Path>,
    default: &str,
) -> Result<String> {
    let Some(path) = path else {
        return Ok(default.to_string());
    };
    let full = config.root_dir.join(path);
    tokio::fs::read_to_string(&full)
        .await
        .map_err(|err| Error::ConfigError(format!("cannot read prompt {}: {}", full.display(), err)))
}
