use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tracing::debug;

pub const DEFAULT_HUB_MODEL: &str = "microsoft/trocr-base-printed";

/// A model repository on the Hugging Face Hub, fetched through the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubModel {
    pub repo_id: String,
    pub revision: Option<String>,
}

impl HubModel {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Download `file` (or reuse the cached copy) and return its local path.
    pub fn fetch(&self, file: &str) -> Result<PathBuf> {
        let api = Api::new().context("failed to initialise Hugging Face Hub client")?;
        let repo = match &self.revision {
            Some(revision) => {
                Repo::with_revision(self.repo_id.clone(), RepoType::Model, revision.clone())
            }
            None => Repo::model(self.repo_id.clone()),
        };
        let path = api
            .repo(repo)
            .get(file)
            .with_context(|| format!("failed to fetch `{file}` from `{}`", self.repo_id))?;
        debug!(repo = %self.repo_id, file, path = %path.display(), "hub file ready");
        Ok(path)
    }
}
