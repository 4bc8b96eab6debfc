//! Minimal safetensors header access.
//!
//! ```text
//! FILE   := LEN HEADER DATA
//! LEN    := u64 little-endian byte length of HEADER
//! HEADER := JSON { "name": { "dtype", "shape", "data_offsets": [start, end] }, "__metadata__"? }
//! ```
//!
//! Tensor bytes are never decoded. When the whole file is read,
//! `safetensors::SafeTensors::deserialize` checks it; the header-only path
//! applies the same layout rules against the file size.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::checked_numel;

/// Headers larger than this are rejected before allocating.
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub data_offsets: [u64; 2],
}

impl TensorInfo {
    /// Number of elements; a scalar (empty shape) has one. `None` on overflow.
    pub fn numel(&self) -> Option<u64> {
        checked_numel(&self.shape)
    }
}

/// Parsed header: tensors in file order plus the optional free-form metadata.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub tensors: Vec<(String, TensorInfo)>,
    pub metadata: Option<Value>,
}

impl Header {
    pub fn get(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    fn parse(json: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(json).context("safetensors header is not valid JSON")?;
        let map = value
            .as_object()
            .ok_or_else(|| anyhow!("safetensors header must be a JSON object"))?;

        let mut header = Header::default();
        for (name, entry) in map {
            if name == "__metadata__" {
                header.metadata = Some(entry.clone());
                continue;
            }
            if name.starts_with("__") {
                continue;
            }
            let info: TensorInfo = serde_json::from_value(entry.clone())
                .with_context(|| format!("failed to parse tensor entry '{name}'"))?;
            header.tensors.push((name.clone(), info));
        }
        header.tensors.sort_by_key(|(_, t)| t.data_offsets);
        Ok(header)
    }

    /// Tensors must tile the data section: contiguous from offset 0, each
    /// spanning exactly `numel * dtype size` bytes, the last ending at
    /// `data_len`.
    fn validate(&self, data_len: u64) -> Result<()> {
        let mut ordered: Vec<&(String, TensorInfo)> = self.tensors.iter().collect();
        ordered.sort_by_key(|(_, t)| t.data_offsets);

        let mut expected = 0u64;
        for (name, info) in ordered {
            let [start, end] = info.data_offsets;
            if start != expected || end < start {
                bail!("tensor '{name}' has invalid data offsets [{start}, {end}]");
            }
            let bytes = info
                .numel()
                .and_then(|n| n.checked_mul(info.dtype.size() as u64))
                .ok_or_else(|| anyhow!("tensor '{name}' shape {:?} overflows u64", info.shape))?;
            if end - start != bytes {
                bail!(
                    "tensor '{name}' spans {} bytes but {:?} {:?} needs {bytes}",
                    end - start,
                    info.dtype,
                    info.shape
                );
            }
            expected = end;
        }
        if expected != data_len {
            bail!("header describes {expected} bytes of tensor data but the file holds {data_len}");
        }
        Ok(())
    }

    /// Serialize back to header JSON, padded with spaces to an 8-byte boundary.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut map = Map::new();
        if let Some(meta) = &self.metadata {
            map.insert("__metadata__".to_string(), meta.clone());
        }
        for (name, info) in &self.tensors {
            map.insert(name.clone(), serde_json::to_value(info)?);
        }
        let mut bytes = serde_json::to_vec(&Value::Object(map))?;
        let padded = bytes.len().div_ceil(8) * 8;
        bytes.resize(padded, b' ');
        Ok(bytes)
    }
}

fn read_len(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .context("file too short for a safetensors length prefix")?;
    let len = u64::from_le_bytes(buf);
    if len > MAX_HEADER_LEN {
        bail!("safetensors header length {len} exceeds {MAX_HEADER_LEN} bytes");
    }
    Ok(len)
}

/// Returns the header and its byte length (without the 8-byte prefix).
fn read_header_from(reader: &mut impl Read) -> Result<(Header, u64)> {
    let len = read_len(reader)?;
    let mut json = vec![0u8; len as usize];
    reader
        .read_exact(&mut json)
        .context("safetensors header truncated")?;
    Ok((Header::parse(&json)?, len))
}

/// Read and check only the header of a safetensors file.
pub fn read_header(path: &Path) -> Result<Header> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let (header, header_len) = read_header_from(&mut file)
        .with_context(|| format!("invalid safetensors file {}", path.display()))?;
    let data_len = file_len
        .checked_sub(8 + header_len)
        .ok_or_else(|| anyhow!("{} is shorter than its header", path.display()))?;
    header
        .validate(data_len)
        .with_context(|| format!("invalid safetensors file {}", path.display()))?;
    Ok(header)
}

/// Write `header` followed by the raw tensor bytes.
pub fn write_with_header(writer: &mut impl Write, header: &Header, data: &[u8]) -> Result<()> {
    let bytes = header.to_bytes()?;
    writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.write_all(data)?;
    Ok(())
}

/// Read a whole safetensors file, returning the header and the tensor data section.
pub fn read_file(path: &Path) -> Result<(Header, Vec<u8>)> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow!("invalid safetensors file {}: {e}", path.display()))?;

    let mut rest = bytes.as_slice();
    let (header, _) = read_header_from(&mut rest)
        .with_context(|| format!("invalid safetensors file {}", path.display()))?;
    Ok((header, rest.to_vec()))
}
