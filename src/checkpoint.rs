use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::safetensors;

/// Prefix `torch.compile` adds to every state-dict key of a compiled module.
pub const COMPILE_PREFIX: &str = "_orig_mod.";

/// Drop `prefix` from every key that starts with it, keeping entry order.
///
/// If a stripped key collides with one already present, the later value wins
/// and the key keeps the position where it first appeared.
pub fn strip_compile_prefix<V, I>(state: I, prefix: &str) -> Vec<(String, V)>
where
    I: IntoIterator<Item = (String, V)>,
{
    let mut out: Vec<(String, V)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (key, value) in state {
        let key = if !prefix.is_empty() && key.starts_with(prefix) {
            key[prefix.len()..].to_string()
        } else {
            key
        };
        match index.get(&key) {
            Some(&pos) => {
                debug!(key = %key, "stripped key replaces an existing entry");
                out[pos].1 = value;
            }
            None => {
                index.insert(key.clone(), out.len());
                out.push((key, value));
            }
        }
    }
    out
}

/// Outcome of [`strip_safetensors_prefix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripSummary {
    pub tensors: usize,
    pub renamed: usize,
}

/// Rewrite a safetensors checkpoint with `prefix` removed from tensor names.
///
/// Tensor bytes are copied unchanged. The output is written to a temporary
/// file next to `output` and moved into place once complete.
pub fn strip_safetensors_prefix(input: &Path, output: &Path, prefix: &str) -> Result<StripSummary> {
    let (mut header, data) = safetensors::read_file(input)?;
    let tensors = header.tensors.len();
    let renamed = header
        .tensors
        .iter()
        .filter(|(name, _)| !prefix.is_empty() && name.starts_with(prefix))
        .count();

    let stripped = strip_compile_prefix(header.tensors, prefix);
    if stripped.len() != tensors {
        bail!(
            "stripping '{prefix}' from {} would merge {} tensors into existing names",
            input.display(),
            tensors - stripped.len()
        );
    }
    if let Some((name, _)) = stripped.iter().find(|(name, _)| name.starts_with("__")) {
        bail!(
            "stripping '{prefix}' from {} leaves reserved tensor name '{name}'",
            input.display()
        );
    }
    header.tensors = stripped;

    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        safetensors::write_with_header(&mut writer, &header, &data)
            .with_context(|| format!("failed to write {}", output.display()))?;
        writer.flush()?;
    }
    tmp.persist(output)
        .with_context(|| format!("failed to move checkpoint into {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        tensors,
        renamed,
        "stripped checkpoint prefix"
    );
    Ok(StripSummary { tensors, renamed })
}
