use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use talkbook_engine::ContentItem;
use talkbook_types::Resource;

/// Book description handed to the CLI, usually exported from a catalog.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BookManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl BookManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read manifest {:?}", path))?;
        let manifest: BookManifest = serde_json::from_str(&raw)
            .with_context(|| format!("parse manifest {:?}", path))?;
        if manifest.id.trim().is_empty() {
            anyhow::bail!("manifest {:?} has an empty id", path);
        }
        Ok(manifest)
    }
}

impl ContentItem for BookManifest {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resources(&self) -> &[Resource] {
        &self.resources
    }
}
