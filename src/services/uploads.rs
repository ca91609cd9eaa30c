//! Object storage on the local filesystem, served back under a public prefix

use std::path::PathBuf;

use log::info;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::{ObjectStore, ServiceError, ServiceResult};

pub struct LocalUploads {
    root: PathBuf,
    public_url: String,
}

impl LocalUploads {
    pub fn new(root: &str, public_url: &str) -> Self {
        Self {
            root: PathBuf::from(root),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }
}

/// `<owner>-<millis>-<random>.<ext>`, keeping only safe characters
fn unique_name(owner: &str, extension: &str) -> String {
    let owner: String = owner
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let extension: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(5)
        .collect();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let stamp = chrono::Utc::now().timestamp_millis();

    if extension.is_empty() {
        format!("{}-{}-{}", owner, stamp, suffix)
    } else {
        format!("{}-{}-{}.{}", owner, stamp, suffix, extension)
    }
}

#[rocket::async_trait]
impl ObjectStore for LocalUploads {
    async fn upload(&self, owner: &str, extension: &str, bytes: Vec<u8>) -> ServiceResult<String> {
        let name = unique_name(owner, extension);
        let path = self.root.join(&name);

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        info!("Stored upload {}", path.display());
        Ok(format!("{}/{}", self.public_url, name))
    }
}
