use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

/// Parse one JSON document per line. Blank lines are skipped.
///
/// `origin` only labels errors, e.g. `data.jsonl:12: expected value`.
pub fn read_jsonl<T, R>(reader: R, origin: &str) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("{origin}:{line_no}: failed to read line"))?;
        if line.trim().is_empty() {
            debug!(origin, line_no, "skipping blank line");
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{origin}:{line_no}: invalid JSON record"))?;
        records.push(record);
    }
    Ok(records)
}

/// Load a JSONL file into typed records, in file order.
pub fn load_jsonl_as<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let records = read_jsonl(BufReader::new(file), &path.display().to_string())?;
    info!(path = %path.display(), records = records.len(), "loaded jsonl");
    Ok(records)
}

/// Load a JSONL file as untyped JSON values.
pub fn load_jsonl(path: &Path) -> Result<Vec<Value>> {
    load_jsonl_as(path)
}

/// Write records as compact JSON, one per line.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "wrote jsonl");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pair {
        question: String,
        answer: String,
    }

    #[test]
    fn test_reads_lines_in_order() {
        let input = "{\"a\": 1}\n{\"a\": 2}\n";
        let records: Vec<Value> = read_jsonl(input.as_bytes(), "mem").unwrap();
        assert_eq!(records, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_skips_blank_lines() {
        let input = "{\"a\": 1}\n\n   \n[1, 2]";
        let records: Vec<Value> = read_jsonl(input.as_bytes(), "mem").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], json!([1, 2]));
    }

    #[test]
    fn test_error_names_line() {
        let input = "{\"a\": 1}\n{not json}\n";
        let err = read_jsonl::<Value, _>(input.as_bytes(), "mem").unwrap_err();
        assert!(err.to_string().contains("mem:2"), "got: {err}");
    }

    #[test]
    fn test_typed_records() {
        let input = r#"{"question": "2+2?", "answer": "4"}"#;
        let records: Vec<Pair> = read_jsonl(input.as_bytes(), "mem").unwrap();
        assert_eq!(
            records,
            vec![Pair {
                question: "2+2?".to_string(),
                answer: "4".to_string()
            }]
        );
    }

    #[test]
    fn test_write_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.jsonl");
        write_jsonl(&path, &[json!({"x": "a\nb"}), json!({"x": 2})]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(load_jsonl(&path).unwrap()[0], json!({"x": "a\nb"}));
    }

    #[test]
    fn test_missing_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_jsonl(&tmp.path().join("absent.jsonl")).is_err());
    }
}
