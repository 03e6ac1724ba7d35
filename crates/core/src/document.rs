//! Loading of pre-parsed definition documents.
//!
//! Schemas, process definitions and engine configuration are handed to the
//! engine as plain documents. The format is chosen from the file extension.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::result::{Result, ResultExt};

/// Serialization format of a definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
    Toml,
}

impl DocumentFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match ext.as_deref() {
            Some("json") => Ok(Self::Json),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            _ => Err(Error::unsupported_format(path)),
        }
    }
}

/// Parse a document from a string in the given format.
pub fn parse_document<T: DeserializeOwned>(content: &str, format: DocumentFormat) -> Result<T> {
    match format {
        DocumentFormat::Json => {
            serde_json::from_str(content).map_err(|e| Error::json_parse_failed(e.to_string()))
        }
        DocumentFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| Error::yaml_parse_failed(e.to_string()))
        }
        DocumentFormat::Toml => {
            toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))
        }
    }
}

/// Read and parse a document, choosing the format from the extension.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = DocumentFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

    tracing::debug!(path = %path.display(), ?format, "Loading definition document");

    parse_document(&content, format).warn_on_error("parse definition document")
}
