//! Dataset file actions
//!
//! Rows are JSON objects. JSON files hold a list of rows (or an object with a
//! `rows` list); CSV/TSV files have a header line and every cell is read as a
//! string. File I/O runs on the context's blocking pool.

use super::type_name;
use crate::actions::{required_str, Action, ActionError, ActionResult};
use crate::context::ExecutionContext;
use crate::resolver::value_to_text;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Json,
    Csv,
    Tsv,
}

impl DatasetFormat {
    /// Explicit `format` parameter first, then the file extension, then JSON
    pub fn detect(params: &Value, path: &Path) -> Result<Self, ActionError> {
        if let Some(format) = params.get("format").and_then(Value::as_str) {
            return Self::parse(format)
                .ok_or_else(|| ActionError::validation(format!("unsupported format '{format}'")));
        }
        Ok(path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
            .unwrap_or(Self::Json))
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "tsv" | "tab" => Some(Self::Tsv),
            _ => None,
        }
    }

    fn delimiter(&self) -> u8 {
        match self {
            Self::Tsv => b'\t',
            _ => b',',
        }
    }
}

/// Reads `params.path` into a list of rows
pub struct LoadDatasetAction;

#[async_trait]
impl Action for LoadDatasetAction {
    async fn execute(&self, params: &Value, context: &mut ExecutionContext) -> ActionResult {
        let path = match required_str(params, "path") {
            Ok(path) => PathBuf::from(path),
            Err(e) => return ActionResult::from_error(e),
        };
        let format = match DatasetFormat::detect(params, &path) {
            Ok(format) => format,
            Err(e) => return ActionResult::from_error(e),
        };

        debug!("Loading {:?} dataset from {}", format, path.display());
        let loaded = context
            .blocking()
            .run(move || read_rows(&path, format))
            .await;

        match loaded {
            Ok(Ok(rows)) => ActionResult::success(Value::Array(rows)),
            Ok(Err(e)) => ActionResult::from_error(e),
            Err(e) => ActionResult::from_error(ActionError::from(e)),
        }
    }

    fn description(&self) -> &str {
        "Load rows from a JSON, CSV or TSV file"
    }
}

/// Writes `params.rows` to `params.path` and records the file in
/// `output_files` under `params.key` (default: the file stem).
///
/// This action mutates the context directly.
pub struct WriteDatasetAction;

#[async_trait]
impl Action for WriteDatasetAction {
    async fn execute(&self, params: &Value, context: &mut ExecutionContext) -> ActionResult {
        let path = match required_str(params, "path") {
            Ok(path) => PathBuf::from(path),
            Err(e) => return ActionResult::from_error(e),
        };
        let rows = match params.get("rows") {
            Some(Value::Array(rows)) => rows.clone(),
            Some(other) => {
                return ActionResult::from_error(ActionError::validation(format!(
                    "'rows' must be a list, got {}",
                    type_name(other)
                )))
            }
            None => {
                return ActionResult::from_error(ActionError::validation(
                    "missing required parameter 'rows'",
                ))
            }
        };
        let format = match DatasetFormat::detect(params, &path) {
            Ok(format) => format,
            Err(e) => return ActionResult::from_error(e),
        };
        let key = params
            .get("key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "output".to_string());

        let count = rows.len();
        let target = path.clone();
        let written = context
            .blocking()
            .run(move || write_rows(&target, format, &rows))
            .await;

        match written {
            Ok(Ok(())) => {
                context.add_output_file(key, path.clone());
                ActionResult::success(json!({
                    "path": path.display().to_string(),
                    "rows": count,
                }))
            }
            Ok(Err(e)) => ActionResult::from_error(e),
            Err(e) => ActionResult::from_error(ActionError::from(e)),
        }
    }

    fn description(&self) -> &str {
        "Write rows to a JSON, CSV or TSV file"
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ActionError {
    if err.kind() == IoErrorKind::NotFound {
        ActionError::not_found(format!("{} does not exist", path.display()))
    } else {
        ActionError::execution(format!("{}: {err}", path.display()))
    }
}

fn read_rows(path: &Path, format: DatasetFormat) -> Result<Vec<Value>, ActionError> {
    match format {
        DatasetFormat::Json => {
            let file = File::open(path).map_err(|e| io_error(path, e))?;
            let value: Value = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| ActionError::validation(format!("{}: {e}", path.display())))?;
            match value {
                Value::Array(rows) => Ok(rows),
                Value::Object(mut map) => match map.remove("rows") {
                    Some(Value::Array(rows)) => Ok(rows),
                    _ => Err(ActionError::validation(format!(
                        "{} must contain a list of rows",
                        path.display()
                    ))),
                },
                other => Err(ActionError::validation(format!(
                    "{} must contain a list of rows, found {}",
                    path.display(),
                    type_name(&other)
                ))),
            }
        }
        DatasetFormat::Csv | DatasetFormat::Tsv => {
            let file = File::open(path).map_err(|e| io_error(path, e))?;
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(format.delimiter())
                .from_reader(BufReader::new(file));
            let headers = reader
                .headers()
                .map_err(|e| ActionError::validation(format!("{}: {e}", path.display())))?
                .clone();

            let mut rows = Vec::new();
            for record in reader.records() {
                let record =
                    record.map_err(|e| ActionError::validation(format!("{}: {e}", path.display())))?;
                let row: Map<String, Value> = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(header, field)| (header.to_string(), Value::String(field.to_string())))
                    .collect();
                rows.push(Value::Object(row));
            }
            Ok(rows)
        }
    }
}

fn write_rows(path: &Path, format: DatasetFormat, rows: &[Value]) -> Result<(), ActionError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    match format {
        DatasetFormat::Json => {
            let file = File::create(path).map_err(|e| io_error(path, e))?;
            serde_json::to_writer_pretty(BufWriter::new(file), rows)
                .map_err(|e| ActionError::execution(format!("{}: {e}", path.display())))
        }
        DatasetFormat::Csv | DatasetFormat::Tsv => {
            // Header is the union of row keys in order of first appearance
            let mut headers: Vec<String> = Vec::new();
            for row in rows {
                let Value::Object(map) = row else {
                    return Err(ActionError::validation(format!(
                        "rows written as {format:?} must be mappings, found {}",
                        type_name(row)
                    )));
                };
                for key in map.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
            }

            let file = File::create(path).map_err(|e| io_error(path, e))?;
            let mut writer = csv::WriterBuilder::new()
                .delimiter(format.delimiter())
                .from_writer(BufWriter::new(file));
            let to_error = |e: csv::Error| ActionError::execution(format!("{}: {e}", path.display()));

            writer.write_record(&headers).map_err(to_error)?;
            for row in rows {
                let record: Vec<String> = headers
                    .iter()
                    .map(|header| row.get(header).map(value_to_text).unwrap_or_default())
                    .collect();
                writer.write_record(&record).map_err(to_error)?;
            }
            writer
                .flush()
                .map_err(|e| ActionError::execution(format!("{}: {e}", path.display())))
        }
    }
}
