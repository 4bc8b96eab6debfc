//! Dataset column normalization.
//!
//! Sources disagree on what to call the same field (`question` vs `prompt`,
//! `Answer Text` vs `response`). A [`ColumnMap`] folds every raw column name
//! to snake_case and then onto a canonical name, so rows from different
//! sources can be merged into one schema.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use heck::ToSnakeCase;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Snake_case a raw column name: `"Question Text"` -> `question_text`.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_snake_case()
}

/// One planned column rename. `to` is `None` when the column is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub to: Option<String>,
}

/// Canonical column names and the aliases that map onto them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    aliases: BTreeMap<String, Vec<String>>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        let mut map = ColumnMap::empty();
        map.insert("prompt", &["question", "instruction", "query", "input_text"]);
        map.insert("response", &["answer", "output", "completion", "target"]);
        map.insert("text", &["content", "body", "document"]);
        map
    }
}

impl ColumnMap {
    pub fn empty() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    /// Register `canonical` with extra aliases, merging with existing ones.
    pub fn insert(&mut self, canonical: &str, aliases: &[&str]) {
        let entry = self.aliases.entry(normalize_name(canonical)).or_default();
        for alias in aliases {
            let alias = normalize_name(alias);
            if !entry.contains(&alias) {
                entry.push(alias);
            }
        }
    }

    /// Load a `{ "canonical": ["alias", ...] }` JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read column aliases from {}", path.display()))?;
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(&text)
            .with_context(|| format!("invalid column alias file {}", path.display()))?;

        let mut map = ColumnMap::empty();
        for (canonical, aliases) in &raw {
            let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
            map.insert(canonical, &aliases);
        }
        map.check_unambiguous()?;
        info!(path = %path.display(), columns = map.aliases.len(), "loaded column aliases");
        Ok(map)
    }

    fn check_unambiguous(&self) -> Result<()> {
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for canonical in self.aliases.keys() {
            owner.insert(canonical.as_str(), canonical.as_str());
        }
        for (canonical, aliases) in &self.aliases {
            let canonical = canonical.as_str();
            for alias in aliases {
                if let Some(prev) = owner.insert(alias.as_str(), canonical)
                    && prev != canonical
                {
                    bail!("column alias '{alias}' maps to both '{prev}' and '{canonical}'");
                }
            }
        }
        Ok(())
    }

    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }

    pub fn is_canonical(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    /// Normalized name of `raw`, replaced by its canonical column when it is a
    /// known alias.
    pub fn resolve(&self, raw: &str) -> String {
        let name = normalize_name(raw);
        if self.is_canonical(&name) {
            return name;
        }
        self.aliases
            .iter()
            .find(|(_, aliases)| aliases.contains(&name))
            .map(|(canonical, _)| canonical.clone())
            .unwrap_or(name)
    }

    /// Plan renames for one set of columns.
    ///
    /// With `keep_unmapped = false`, columns that do not resolve to a
    /// canonical name are dropped. Fails if two columns land on one name.
    pub fn rename_plan<S: AsRef<str>>(
        &self,
        columns: &[S],
        keep_unmapped: bool,
    ) -> Result<Vec<Rename>> {
        let mut claimed: HashMap<String, &str> = HashMap::new();
        let mut plan = Vec::with_capacity(columns.len());

        for column in columns {
            let from = column.as_ref();
            let target = self.resolve(from);
            if !keep_unmapped && !self.is_canonical(&target) {
                plan.push(Rename {
                    from: from.to_string(),
                    to: None,
                });
                continue;
            }
            if let Some(prev) = claimed.insert(target.clone(), from) {
                bail!("columns '{prev}' and '{from}' both normalize to '{target}'");
            }
            plan.push(Rename {
                from: from.to_string(),
                to: Some(target),
            });
        }
        Ok(plan)
    }

    /// Rename the keys of one object record. Columns keep their order.
    pub fn normalize_record(
        &self,
        record: Map<String, Value>,
        keep_unmapped: bool,
    ) -> Result<Map<String, Value>> {
        let columns: Vec<&String> = record.keys().collect();
        let plan = self.rename_plan(&columns, keep_unmapped)?;

        let mut targets: HashMap<String, Option<String>> =
            plan.into_iter().map(|r| (r.from, r.to)).collect();
        let mut out = Map::new();
        for (key, value) in record {
            match targets.remove(&key).flatten() {
                Some(to) => {
                    out.insert(to, value);
                }
                None => debug!(column = %key, "dropping unmapped column"),
            }
        }
        Ok(out)
    }
}

/// Normalize the columns of every record. Each record is planned on its own,
/// so rows from sources with different schemas can be mixed.
pub fn normalize_records(
    records: Vec<Value>,
    map: &ColumnMap,
    keep_unmapped: bool,
) -> Result<Vec<Value>> {
    records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| match record {
            Value::Object(obj) => map
                .normalize_record(obj, keep_unmapped)
                .map(Value::Object)
                .with_context(|| format!("record {}", idx + 1)),
            other => Err(anyhow!(
                "record {} is a {}, expected a JSON object",
                idx + 1,
                json_kind(&other)
            )),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Question Text"), "question_text");
        assert_eq!(normalize_name("responseText"), "response_text");
        assert_eq!(normalize_name("  ANSWER "), "answer");
        assert_eq!(normalize_name("input-text"), "input_text");
    }

    #[test]
    fn test_resolve_aliases() {
        let map = ColumnMap::default();
        assert_eq!(map.resolve("Question"), "prompt");
        assert_eq!(map.resolve("Input Text"), "prompt");
        assert_eq!(map.resolve("completion"), "response");
        assert_eq!(map.resolve("Prompt"), "prompt");
        assert_eq!(map.resolve("Source URL"), "source_url");
    }

    #[test]
    fn test_rename_plan_drops_unmapped() {
        let map = ColumnMap::default();
        let plan = map.rename_plan(&["question", "answer", "id"], false).unwrap();
        assert_eq!(plan[0].to.as_deref(), Some("prompt"));
        assert_eq!(plan[1].to.as_deref(), Some("response"));
        assert_eq!(plan[2].to, None);

        let plan = map.rename_plan(&["question", "id"], true).unwrap();
        assert_eq!(plan[1].to.as_deref(), Some("id"));
    }

    #[test]
    fn test_rename_plan_rejects_collisions() {
        let map = ColumnMap::default();
        let err = map.rename_plan(&["question", "instruction"], true).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn test_heterogeneous_sources_share_schema() {
        let map = ColumnMap::default();
        let records = vec![
            json!({"question": "q1", "answer": "a1"}),
            json!({"Instruction": "q2", "Output": "a2", "meta": 1}),
        ];
        let out = normalize_records(records, &map, false).unwrap();
        assert_eq!(out[0], json!({"prompt": "q1", "response": "a1"}));
        assert_eq!(out[1], json!({"prompt": "q2", "response": "a2"}));
    }

    #[test]
    fn test_output_keeps_source_column_order() {
        let map = ColumnMap::default();
        let record = json!({"answer": "a", "question": "q", "zeta": 1, "alpha": 2});
        let Value::Object(record) = record else {
            unreachable!()
        };
        let out = map.normalize_record(record, true).unwrap();
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["response", "prompt", "zeta", "alpha"]);

        let line = serde_json::to_string(&Value::Object(out)).unwrap();
        assert!(line.starts_with(r#"{"response":"a","prompt":"q""#), "got: {line}");
    }

    #[test]
    fn test_non_object_record_errors() {
        let map = ColumnMap::default();
        let err = normalize_records(vec![json!(["x"])], &map, true).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_alias_file_and_ambiguity() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = tmp.path().join("ok.json");
        std::fs::write(&ok, r#"{"label": ["Category", "class"]}"#).unwrap();
        let map = ColumnMap::from_json_file(&ok).unwrap();
        assert_eq!(map.resolve("class"), "label");
        assert_eq!(map.canonical_names().collect::<Vec<_>>(), vec!["label"]);

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, r#"{"a": ["x"], "b": ["x"]}"#).unwrap();
        assert!(ColumnMap::from_json_file(&bad).is_err());
    }
}
