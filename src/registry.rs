//! Model registry: lazy, load-once cache of models by public name
//!
//! Each catalog name owns a slot holding a `tokio::sync::OnceCell`. The
//! first request for a name runs the (blocking) load on the blocking pool;
//! concurrent requests for the same name wait on that same load. A failed
//! load leaves the cell empty, so the next request tries again. Models stay
//! loaded for the lifetime of the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::catalog::{self, CatalogEntry};
use crate::error::{LensError, LensResult};
use crate::model::{LensModel, LoadOptions};

/// Builds a model for a catalog entry. Runs on the blocking pool.
pub trait ModelLoader: Send + Sync {
    fn load(&self, entry: &CatalogEntry) -> anyhow::Result<LensModel>;
}

/// Loads from the HuggingFace Hub (or its local cache)
#[derive(Debug, Clone, Default)]
pub struct HubLoader {
    opts: LoadOptions,
}

impl HubLoader {
    pub fn new(opts: LoadOptions) -> Self {
        Self { opts }
    }
}

impl ModelLoader for HubLoader {
    fn load(&self, entry: &CatalogEntry) -> anyhow::Result<LensModel> {
        LensModel::from_pretrained(entry, &self.opts)
    }
}

/// A loaded model. All computation on it is serialized through the lock.
pub struct ModelHandle {
    entry: &'static CatalogEntry,
    model: Mutex<LensModel>,
}

impl ModelHandle {
    pub fn new(entry: &'static CatalogEntry, model: LensModel) -> Self {
        Self {
            entry,
            model: Mutex::new(model),
        }
    }

    pub fn entry(&self) -> &'static CatalogEntry {
        self.entry
    }

    /// Exclusive access to the model for one computation
    pub fn lock(&self) -> LensResult<MutexGuard<'_, LensModel>> {
        self.model.lock().map_err(|_| {
            LensError::Internal(anyhow::anyhow!(
                "model {} poisoned by an earlier panic",
                self.entry.name
            ))
        })
    }
}

/// Last-use time per model name
#[derive(Debug, Default)]
pub struct UsageLog {
    last_used: RwLock<BTreeMap<String, DateTime<Utc>>>,
}

impl UsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_use(&self, model_name: &str) {
        let now = Utc::now();
        match self.last_used.write() {
            Ok(mut map) => {
                map.insert(model_name.to_string(), now);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(model_name.to_string(), now);
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, DateTime<Utc>> {
        match self.last_used.read() {
            Ok(map) => map.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

type Slot = Arc<OnceCell<Arc<ModelHandle>>>;

/// Name -> loaded model, populated on first use
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    slots: Mutex<HashMap<&'static str, Slot>>,
    usage: UsageLog,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
            usage: UsageLog::new(),
        }
    }

    /// Registry backed by the HuggingFace Hub
    pub fn from_hub(opts: LoadOptions) -> Self {
        Self::new(Arc::new(HubLoader::new(opts)))
    }

    fn slot(&self, entry: &'static CatalogEntry) -> LensResult<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| LensError::Internal(anyhow::anyhow!("registry slot map poisoned")))?;
        Ok(Arc::clone(slots.entry(entry.name).or_default()))
    }

    /// The loaded model for `name`, loading it on first use.
    pub async fn get_or_load(&self, name: &str) -> LensResult<Arc<ModelHandle>> {
        let entry = catalog::lookup(name).ok_or_else(|| LensError::NotFound(name.to_string()))?;
        let slot = self.slot(entry)?;

        let handle = slot
            .get_or_try_init(|| async {
                info!("Loading model {} on first use", entry.name);
                let loader = Arc::clone(&self.loader);
                let model = tokio::task::spawn_blocking(move || loader.load(entry))
                    .await
                    .map_err(|e| anyhow::anyhow!("model load task failed: {e}"))??;
                Ok::<_, LensError>(Arc::new(ModelHandle::new(entry, model)))
            })
            .await?;
        debug!("Model {} ready", entry.name);
        Ok(Arc::clone(handle))
    }

    /// Whether `name` is currently loaded
    pub fn is_loaded(&self, name: &str) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.get(name).is_some_and(|s| s.initialized()))
            .unwrap_or(false)
    }

    pub fn record_use(&self, model_name: &str) {
        self.usage.record_use(model_name);
    }

    pub fn usage(&self) -> &UsageLog {
        &self.usage
    }
}
