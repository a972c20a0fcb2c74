// ABOUTME: Image preparation for registry entries: pull-if-missing or build-on-demand
// ABOUTME: Built images are tagged by Dockerfile content hash and built at most once per hash

use crate::engine::EngineClient;
use crate::error::{Result, SandboxError};
use crate::registry::RegistryEntry;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Tag for an image built from `dockerfile` under repository `repo`
pub fn build_tag(repo: &str, dockerfile: &str) -> String {
    format!("{}:{}", repo, &dockerfile_hash(dockerfile)[..12])
}

fn dockerfile_hash(dockerfile: &str) -> String {
    format!("{:x}", Sha256::digest(dockerfile.as_bytes()))
}

pub struct ImageCache {
    engine: Arc<EngineClient>,
    timeout: Duration,
    label_prefix: String,
    ready: RwLock<HashSet<String>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageCache {
    pub fn new(engine: Arc<EngineClient>, timeout: Duration, label_prefix: &str) -> Self {
        Self {
            engine,
            timeout,
            label_prefix: label_prefix.to_string(),
            ready: RwLock::new(HashSet::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the entry's image exists locally and return the reference to run
    pub async fn ensure(&self, entry: &RegistryEntry) -> Result<String> {
        match &entry.build {
            Some(build) => {
                let tag = build_tag(&entry.image, &build.dockerfile);
                self.ensure_image(&tag, Some(&build.dockerfile)).await?;
                Ok(tag)
            }
            None => {
                self.ensure_image(&entry.image, None).await?;
                Ok(entry.image.clone())
            }
        }
    }

    async fn ensure_image(&self, image: &str, dockerfile: Option<&str>) -> Result<()> {
        if self.ready.read().await.contains(image) {
            return Ok(());
        }

        // One pull/build per image at a time; latecomers find it ready
        let lock = self.lock_for(image);
        let _guard = lock.lock().await;
        if self.ready.read().await.contains(image) {
            return Ok(());
        }

        let engine = self.engine.get().await?;
        if engine.image_exists(image).await? {
            debug!("Image {} already present", image);
        } else {
            let work = async {
                match dockerfile {
                    Some(dockerfile) => {
                        let labels = HashMap::from([(
                            format!("{}.dockerfile_sha256", self.label_prefix),
                            dockerfile_hash(dockerfile),
                        )]);
                        engine.build_image(image, dockerfile, labels).await
                    }
                    None => engine.pull_image(image).await,
                }
            };

            match tokio::time::timeout(self.timeout, work).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SandboxError::Timeout(format!(
                        "Preparing image {} took longer than {:?}",
                        image, self.timeout
                    )))
                }
            }
            info!("Image {} is ready", image);
        }

        self.ready.write().await.insert(image.to_string());
        Ok(())
    }

    fn lock_for(&self, image: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(image.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
