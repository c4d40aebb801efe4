//! Input documents and the annotation schema

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use annot_agent::Publication;
use serde_json::Value;
use uuid::Uuid;

pub const PAPER_FILENAME: &str = "paper.md";

/// Load every `<uuid>/paper.md` below `dir`, sorted by uuid.
///
/// Entries that are not uuid-named folders with a paper are skipped.
pub fn load_publications(dir: &Path) -> anyhow::Result<Vec<Publication>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read publications folder {}", dir.display()))?;

    let mut publications = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        if Uuid::parse_str(&name).is_err() {
            tracing::warn!("Skipping {}: folder name is not a UUID", path.display());
            continue;
        }

        let paper = path.join(PAPER_FILENAME);
        if !paper.is_file() {
            tracing::warn!("Skipping {}: no {}", path.display(), PAPER_FILENAME);
            continue;
        }

        let text = fs::read_to_string(&paper)
            .with_context(|| format!("Failed to read {}", paper.display()))?;
        publications.push(Publication { uuid: name, text });
    }

    publications.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    tracing::info!("Loaded {} publications", publications.len());
    Ok(publications)
}

/// Load the annotation schema made available to prompts as `{schema}`
pub fn load_schema(path: &Path) -> anyhow::Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse schema file {}", path.display()))
}
