use pyo3::exceptions::PyValueError;
use pyo3::prelude::Bound;
use pyo3::prelude::*;

use nbkit::checkpoint::{self, COMPILE_PREFIX};
use nbkit::columns::ColumnMap;
use nbkit::{ParamRecord, ParameterCount, ParameterSource, StorageId};

/// Parameters handed over from Python as `(name, numel, storage)` tuples,
/// where `storage` is typically `tensor.data_ptr()`.
struct PyParams {
    params: Vec<ParamRecord>,
    embedding: Option<StorageId>,
}

impl ParameterSource for PyParams {
    fn named_parameters(&self) -> impl Iterator<Item = ParamRecord> + '_ {
        self.params.iter().cloned()
    }

    fn embedding_storage(&self) -> Option<StorageId> {
        self.embedding
    }
}

fn breakdown_of(
    params: Vec<(String, u64, u64)>,
    embedding_storage: Option<u64>,
) -> PyResult<ParameterCount> {
    params
        .iter()
        .try_fold(0u64, |acc, (_, numel, _)| acc.checked_add(*numel))
        .ok_or_else(|| PyValueError::new_err("total parameter count overflows u64"))?;
    let source = PyParams {
        params: params
            .into_iter()
            .map(|(name, numel, storage)| ParamRecord::new(name, numel, StorageId(storage)))
            .collect(),
        embedding: embedding_storage.map(StorageId),
    };
    Ok(nbkit::count_parameters(&source))
}

/// `count_parameters([(name, numel, data_ptr), ...], embedding_storage=None)`
/// -> `(total, [(category, count), ...])`.
#[pyfunction]
#[pyo3(signature = (params, embedding_storage=None))]
pub fn count_parameters(
    params: Vec<(String, u64, u64)>,
    embedding_storage: Option<u64>,
) -> PyResult<(u64, Vec<(String, u64)>)> {
    let (total, breakdown) = breakdown_of(params, embedding_storage)?.into_parts();
    let entries = breakdown
        .iter()
        .map(|(category, n)| (category.as_str().to_string(), n))
        .collect();
    Ok((total, entries))
}

/// Same inputs as `count_parameters`, returns the printable breakdown table.
#[pyfunction]
#[pyo3(signature = (params, embedding_storage=None))]
pub fn format_breakdown(
    params: Vec<(String, u64, u64)>,
    embedding_storage: Option<u64>,
) -> PyResult<String> {
    Ok(breakdown_of(params, embedding_storage)?.render())
}

/// `dict(strip_compile_prefix(list(state_dict.items())))`
#[pyfunction]
#[pyo3(signature = (items, prefix=COMPILE_PREFIX))]
pub fn strip_compile_prefix(
    items: Vec<(String, PyObject)>,
    prefix: &str,
) -> Vec<(String, PyObject)> {
    checkpoint::strip_compile_prefix(items, prefix)
}

/// Canonical dataset column name for `name` under the built-in aliases.
#[pyfunction]
pub fn normalize_column(name: &str) -> String {
    ColumnMap::default().resolve(name)
}

#[pymodule]
fn nbkit_py(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(count_parameters, m)?)?;
    m.add_function(wrap_pyfunction!(format_breakdown, m)?)?;
    m.add_function(wrap_pyfunction!(strip_compile_prefix, m)?)?;
    m.add_function(wrap_pyfunction!(normalize_column, m)?)?;
    m.add("COMPILE_PREFIX", COMPILE_PREFIX)?;
    Ok(())
}
