use crate::{
    Error, JobParams, JobType, PresignedResponse, PresignedUrl, Result, UploadFile, UploadRequest,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::*;

/// One file to submit, with the destination the backend issued for it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub file: PathBuf,
    pub file_id: String,
    pub job_type: JobType,
    #[serde(default)]
    pub index: Option<usize>,
    pub presigned_url: PresignedUrl,
    #[serde(default)]
    pub target_page_numbers: Option<Vec<u32>>,
}

impl ManifestEntry {
    pub fn filename(&self) -> String {
        self.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.display().to_string())
    }
}

/// Identity shared by every submission in one run.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub api_url: String,
    pub token: String,
    pub user_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parses and validates a manifest. Explicit indices must name a slot
    /// of the state table, which has one slot per entry, and no two entries
    /// may share one.
    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut taken = vec![false; self.entries.len()];
        for (position, entry) in self.entries.iter().enumerate() {
            let index = entry.index.unwrap_or(position);
            match taken.get_mut(index) {
                None => {
                    return Err(Error::InvalidManifest(format!(
                        "{}: index {} is out of range for {} entries",
                        entry.file.display(),
                        index,
                        self.entries.len()
                    )))
                }
                Some(true) => {
                    return Err(Error::InvalidManifest(format!(
                        "{}: index {} is already used",
                        entry.file.display(),
                        index
                    )))
                }
                Some(slot) => *slot = true,
            }
        }
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(message = "Loading manifest", path = %path.display());
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }

    /// Names in file-index order, for seeding a state table.
    pub fn filenames(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.entries.len()];
        for (position, entry) in self.entries.iter().enumerate() {
            if let Some(slot) = names.get_mut(entry.index.unwrap_or(position)) {
                *slot = entry.filename();
            }
        }
        names
    }

    /// Reads every file and builds its upload request. File paths are
    /// resolved relative to `base_dir`.
    pub async fn into_requests(
        self,
        base_dir: &Path,
        ctx: &SubmitContext,
    ) -> Result<Vec<UploadRequest>> {
        let mut requests = Vec::with_capacity(self.entries.len());
        for (position, entry) in self.entries.into_iter().enumerate() {
            let filename = entry.filename();
            let bytes = tokio::fs::read(base_dir.join(&entry.file)).await?;
            let job_params = entry.target_page_numbers.map(|pages| JobParams {
                target_page_numbers: Some(pages),
            });

            requests.push(UploadRequest {
                api_url: ctx.api_url.clone(),
                job_type: entry.job_type,
                user_id: ctx.user_id.clone(),
                client_id: ctx.client_id.clone(),
                file_id: entry.file_id,
                destination: PresignedResponse {
                    presigned_url: entry.presigned_url,
                },
                file: UploadFile {
                    name: filename,
                    bytes,
                },
                token: ctx.token.clone(),
                file_index: entry.index.unwrap_or(position),
                job_params,
            });
        }
        Ok(requests)
    }
}
