use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::error::PolicySourceError;
use crate::loader;
use crate::schema::PolicyDocument;

/// Where the enforcer gets its policy snapshot from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// The document to use for one evaluation.
    async fn get_policy(&self) -> Result<Arc<PolicyDocument>, PolicySourceError>;

    /// `Ok(false)` makes the evaluation fall back to the default effect.
    async fn validate_policy(&self, doc: &PolicyDocument) -> Result<bool, PolicySourceError> {
        match loader::validate(doc) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "policy document failed validation");
                Ok(false)
            }
        }
    }

    /// Generation counter bumped on every reload, if the source supports it.
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// In-memory policy snapshot, optionally backed by a file.
///
/// Readers always get a complete document; [`PolicyStore::replace`] and
/// [`PolicyStore::reload`] swap the whole snapshot and bump the generation.
/// Documents are stored unvalidated so that a broken file degrades to the
/// default effect at evaluation time.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicyDocument>>,
    path: Option<PathBuf>,
    generation: watch::Sender<u64>,
}

impl PolicyStore {
    pub fn new(doc: PolicyDocument) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(doc)),
            path: None,
            generation,
        }
    }

    /// Read the document at `path`. Later [`reload`](Self::reload) calls
    /// re-read the same file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PolicySourceError> {
        let path = path.as_ref().to_path_buf();
        let doc = read_document(&path).await?;
        info!(path = %path.display(), name = ?doc.name, rules = doc.rules.len(), "policy loaded");
        let mut store = Self::new(doc);
        store.path = Some(path);
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub async fn replace(&self, doc: PolicyDocument) {
        *self.current.write().await = Arc::new(doc);
        self.generation.send_modify(|g| *g += 1);
    }

    /// Re-read the backing file. On failure the current snapshot is kept.
    /// Stores created with [`PolicyStore::new`] have nothing to reload.
    pub async fn reload(&self) -> Result<(), PolicySourceError> {
        let Some(path) = &self.path else {
            return Err(PolicySourceError::Unavailable(
                "store has no backing file".to_string(),
            ));
        };
        let doc = read_document(path).await?;
        info!(path = %path.display(), rules = doc.rules.len(), "policy reloaded");
        self.replace(doc).await;
        Ok(())
    }
}

#[async_trait]
impl PolicySource for PolicyStore {
    async fn get_policy(&self) -> Result<Arc<PolicyDocument>, PolicySourceError> {
        Ok(Arc::clone(&*self.current.read().await))
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.generation.subscribe())
    }
}

async fn read_document(path: &Path) -> Result<PolicyDocument, PolicySourceError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PolicySourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
    loader::parse_policy_str(&contents).map_err(|e| PolicySourceError::Parse(format!("{e:#}")))
}
