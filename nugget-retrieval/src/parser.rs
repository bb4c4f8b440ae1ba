use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};

use crate::errors::{RetrievalError, RetrievalResult};
use crate::models::{Document, DocumentType, Relation, SourceKind};

fn default_confidence() -> f32 {
    0.8
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontMatter {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default)]
    pub related: Vec<Relation>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Parse a markdown file with a `---` delimited YAML header.
///
/// `path` only feeds error messages and [`Document::path`].
pub fn parse_document(raw: &str, path: Option<&Path>) -> RetrievalResult<Document> {
    let (front_matter, body) = split_front_matter(raw).ok_or_else(|| {
        RetrievalError::MissingFrontMatter(path.map(Path::to_path_buf).unwrap_or_default())
    })?;
    let front: FrontMatter = serde_yaml::from_str(front_matter).map_err(|err| {
        RetrievalError::InvalidFrontMatter(match path {
            Some(path) => format!("{}: {err}", path.display()),
            None => err.to_string(),
        })
    })?;

    let id = front.id.trim().to_string();
    if id.is_empty() {
        return Err(RetrievalError::MissingField("id"));
    }
    let domain = front.domain.trim().trim_matches('/').to_string();
    if domain.is_empty() {
        return Err(RetrievalError::MissingField("domain"));
    }
    if !front.confidence.is_finite() || !(0.0..=1.0).contains(&front.confidence) {
        return Err(RetrievalError::InvalidFrontMatter(format!(
            "confidence {} outside [0, 1] for {id}",
            front.confidence
        )));
    }

    let relations = front
        .related
        .into_iter()
        .map(|relation| Relation {
            id: relation.id.trim().to_string(),
            relation: relation.relation,
        })
        .filter(|relation| !relation.id.is_empty())
        .collect();

    Ok(Document {
        id,
        doc_type: front.doc_type,
        domain,
        tags: front.tags,
        confidence: front.confidence,
        source: front.source,
        relations,
        created: front.created,
        modified: front.last_modified.unwrap_or(front.created),
        body: body.to_string(),
        path: path.map(Path::to_path_buf),
    })
}

/// Split into (yaml, body). The closing fence must start a line.
fn split_front_matter(raw: &str) -> Option<(&str, &str)> {
    let trimmed = raw.trim_start();
    let rest = trimmed.strip_prefix("---")?;
    let after_opening = &rest[rest.find('\n')? + 1..];

    let mut offset = 0;
    for line in after_opening.split_inclusive('\n') {
        if line.starts_with("---") {
            let yaml = &after_opening[..offset];
            let body = after_opening[offset + line.len()..].trim_start_matches(['\n', '\r']);
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid timestamp '{value}'"))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_timestamp(&value).map_err(serde::de::Error::custom)
}

fn deserialize_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    value
        .map(|value| parse_timestamp(&value).map_err(serde::de::Error::custom))
        .transpose()
}
