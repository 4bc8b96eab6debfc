use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::params::{ParamRecord, ParameterSource, StorageId};
use crate::safetensors;
use crate::utils::checked_numel;

/// Parameter that identifies the input embedding when nothing else is given.
pub const DEFAULT_EMBEDDING: &str = "embed.weight";

/// In-memory parameter table.
#[derive(Debug, Clone)]
pub struct ParamTable {
    params: Vec<ParamRecord>,
    embedding: String,
    next_storage: u64,
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING)
    }
}

impl ParamTable {
    pub fn new(embedding: impl Into<String>) -> Self {
        Self {
            params: Vec::new(),
            embedding: embedding.into(),
            next_storage: 0,
        }
    }

    /// Append a parameter with its own storage.
    pub fn push(&mut self, name: impl Into<String>, numel: u64) -> StorageId {
        let storage = StorageId(self.next_storage);
        self.next_storage += 1;
        self.params.push(ParamRecord::new(name, numel, storage));
        storage
    }

    /// Append a parameter that shares storage with an existing one.
    pub fn push_shared(&mut self, name: impl Into<String>, numel: u64, storage: StorageId) {
        self.params.push(ParamRecord::new(name, numel, storage));
    }

    /// Append a parameter that shares storage with the parameter called `target`.
    pub fn tie(&mut self, name: impl Into<String>, numel: u64, target: &str) -> Result<()> {
        let storage = self
            .storage_of(target)
            .with_context(|| format!("cannot tie to unknown parameter '{target}'"))?;
        self.push_shared(name, numel, storage);
        Ok(())
    }

    pub fn storage_of(&self, name: &str) -> Option<StorageId> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.storage)
    }

    pub fn embedding_name(&self) -> &str {
        &self.embedding
    }

    pub fn set_embedding(&mut self, name: impl Into<String>) {
        self.embedding = name.into();
    }

    pub(crate) fn len(&self) -> usize {
        self.params.len()
    }

    /// Sum of all element counts. Errors if the sum does not fit in `u64`,
    /// which [`count_parameters`](crate::count_parameters) relies on.
    pub fn checked_total(&self) -> Result<u64> {
        self.params.iter().try_fold(0u64, |acc, p| {
            acc.checked_add(p.numel)
                .with_context(|| format!("total parameter count overflows u64 at '{}'", p.name))
        })
    }

    /// Build from a JSON manifest:
    ///
    /// ```json
    /// { "embedding": "embed.weight",
    ///   "parameters": [ { "name": "embed.weight", "shape": [50304, 768] },
    ///                   { "name": "lm_head.weight", "numel": 38633472, "storage": "embed.weight" } ] }
    /// ```
    ///
    /// Entries without `storage` get their own; equal tokens share storage.
    pub fn from_manifest_str(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(text).context("invalid parameter manifest")?;
        let mut table = ParamTable::new(manifest.embedding);
        let mut tokens: HashMap<String, StorageId> = HashMap::new();

        for entry in manifest.parameters {
            let numel = match (entry.numel, &entry.shape) {
                (Some(n), None) => n,
                (None, Some(shape)) => shape_numel(&entry.name, shape)?,
                (Some(n), Some(shape)) => {
                    let from_shape = shape_numel(&entry.name, shape)?;
                    if n != from_shape {
                        bail!(
                            "parameter '{}' has numel {n} but shape {:?} holds {from_shape}",
                            entry.name,
                            shape
                        );
                    }
                    n
                }
                (None, None) => bail!("parameter '{}' needs a shape or numel", entry.name),
            };
            let token = entry.storage.unwrap_or_else(|| entry.name.clone());
            match tokens.get(&token) {
                Some(&storage) => table.push_shared(entry.name, numel, storage),
                None => {
                    let storage = table.push(entry.name, numel);
                    tokens.insert(token, storage);
                }
            }
        }
        table.checked_total()?;
        Ok(table)
    }

    pub fn from_manifest_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let table = Self::from_manifest_str(&text)
            .with_context(|| format!("failed to load manifest {}", path.display()))?;
        info!(path = %path.display(), parameters = table.len(), "loaded parameter manifest");
        Ok(table)
    }

    /// Build from a safetensors header, in file order.
    ///
    /// Every tensor in a valid file owns its bytes, so a tied output head is
    /// not stored at all. Pass its name as `tied_head` to count it as sharing
    /// the embedding's storage.
    pub fn from_safetensors(
        path: &Path,
        embedding: &str,
        tied_head: Option<&str>,
    ) -> Result<Self> {
        let header = safetensors::read_header(path)?;
        let mut table = ParamTable::new(embedding);

        for (name, info) in header.tensors {
            let numel = info
                .numel()
                .with_context(|| format!("parameter '{name}' shape {:?} overflows u64", info.shape))?;
            table.push(name, numel);
        }

        let embed = table
            .params
            .iter()
            .find(|p| p.name == embedding)
            .map(|p| (p.numel, p.storage));
        match (tied_head, embed) {
            (Some(head), _) if table.storage_of(head).is_some() => {
                warn!(path = %path.display(), head, "head tensor is stored in the file; not tying it");
            }
            (Some(head), Some((numel, storage))) => {
                debug!(head, embedding, numel, "tied head shares the embedding");
                table.push_shared(head, numel, storage);
            }
            (Some(head), None) => {
                bail!("cannot tie '{head}': embedding '{embedding}' not found in {}", path.display());
            }
            (None, Some(_)) if !table.params.iter().any(|p| p.name.contains("lm_head")) => {
                warn!(
                    path = %path.display(),
                    "no lm_head tensor; if the head is tied to the embedding, pass --tied-head"
                );
            }
            (None, None) => {
                warn!(path = %path.display(), embedding, "embedding tensor not found");
            }
            (None, Some(_)) => {}
        }

        table.checked_total()?;
        info!(path = %path.display(), tensors = table.len(), "read safetensors header");
        Ok(table)
    }
}

fn shape_numel(name: &str, shape: &[u64]) -> Result<u64> {
    checked_numel(shape).with_context(|| format!("parameter '{name}' shape {shape:?} overflows u64"))
}

impl ParameterSource for ParamTable {
    fn named_parameters(&self) -> impl Iterator<Item = ParamRecord> + '_ {
        self.params.iter().cloned()
    }

    fn embedding_storage(&self) -> Option<StorageId> {
        self.storage_of(&self.embedding)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default = "default_embedding")]
    embedding: String,
    parameters: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    #[serde(default)]
    shape: Option<Vec<u64>>,
    #[serde(default)]
    numel: Option<u64>,
    #[serde(default)]
    storage: Option<String>,
}

fn default_embedding() -> String {
    DEFAULT_EMBEDDING.to_string()
}

/// `tch` models: parameters come from the `VarStore`, sorted by name, and
/// storage identity is the tensor's data pointer.
#[cfg(feature = "torch")]
pub mod torch {
    use tch::nn::VarStore;

    use crate::params::{ParamRecord, ParameterSource, StorageId};

    pub struct VarStoreSource<'a> {
        store: &'a VarStore,
        embedding: String,
    }

    impl<'a> VarStoreSource<'a> {
        pub fn new(store: &'a VarStore, embedding: impl Into<String>) -> Self {
            Self {
                store,
                embedding: embedding.into(),
            }
        }
    }

    impl ParameterSource for VarStoreSource<'_> {
        fn named_parameters(&self) -> impl Iterator<Item = ParamRecord> + '_ {
            let mut vars: Vec<_> = self.store.variables().into_iter().collect();
            vars.sort_by(|a, b| a.0.cmp(&b.0));
            vars.into_iter().map(|(name, tensor)| {
                let storage = StorageId(tensor.data_ptr() as usize as u64);
                ParamRecord::new(name, tensor.numel() as u64, storage)
            })
        }

        fn embedding_storage(&self) -> Option<StorageId> {
            self.store
                .variables()
                .get(&self.embedding)
                .map(|t| StorageId(t.data_ptr() as usize as u64))
        }
    }
}
