use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{HnswParams, StoreKind};
use crate::error::{RagError, Result};
use crate::manifest::IndexManifest;
use crate::semantic::canonical_model_id;
use crate::util::{ensure_directory, now_utc_string, read_json, remove_dir_if_exists};

pub const META_FILE: &str = "index_meta.json";
pub const MANIFEST_FILE: &str = "index_manifest.json";
pub const EVAL_DIR: &str = "eval";
pub const DEFAULT_COLLECTION: &str = "chunks_default";

/// Snapshot of how a collection was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub collection: String,
    pub store: StoreKind,
    pub model: String,
    pub dim: usize,
    pub n_chunks: usize,
    pub built_at: String,
    pub duration_sec: f64,
    #[serde(default)]
    pub run_ids: Vec<i64>,
    #[serde(default)]
    pub source_ids: Vec<i64>,
    pub checksum: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw: Option<HnswParams>,
}

impl IndexMeta {
    /// Fails when the caller asserts a model other than the one the collection was built with.
    pub fn ensure_model(&self, expected: Option<&str>) -> Result<()> {
        let Some(expected) = expected.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(());
        };

        if canonical_model_id(expected) == canonical_model_id(&self.model) {
            return Ok(());
        }

        Err(RagError::ModelCoherence {
            collection: self.collection.clone(),
            recorded: self.model.clone(),
            expected: expected.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CollectionLayout {
    models_dir: PathBuf,
    store: StoreKind,
    name: String,
}

impl CollectionLayout {
    pub fn new(models_dir: &Path, store: StoreKind, name: &str) -> Result<Self> {
        validate_collection_name(name)?;
        Ok(Self {
            models_dir: models_dir.to_path_buf(),
            store,
            name: name.to_string(),
        })
    }

    pub fn store(&self) -> StoreKind {
        self.store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store_dir(&self) -> PathBuf {
        self.models_dir.join(self.store.as_str())
    }

    pub fn dir(&self) -> PathBuf {
        self.store_dir().join(&self.name)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir().join(META_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir().join(MANIFEST_FILE)
    }

    pub fn eval_dir(&self) -> PathBuf {
        self.dir().join(EVAL_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.store_dir().join(format!(".{}.staging", self.name))
    }

    fn retired_dir(&self) -> PathBuf {
        self.store_dir().join(format!(".{}.retired", self.name))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.store_dir().join(format!(".{}.lock", self.name))
    }

    pub fn exists(&self) -> bool {
        self.meta_path().is_file()
    }

    pub fn load_meta(&self) -> Result<IndexMeta> {
        read_json(&self.meta_path())?.ok_or_else(|| RagError::CollectionNotFound {
            store: self.store.to_string(),
            collection: self.name.clone(),
            path: self.dir(),
        })
    }

    pub fn try_load_meta(&self) -> Result<Option<IndexMeta>> {
        read_json(&self.meta_path())
    }

    pub fn load_manifest(&self) -> Result<Option<IndexManifest>> {
        IndexManifest::load(&self.manifest_path())
    }

    /// Fresh, empty staging directory for the next commit.
    pub fn prepare_staging(&self) -> Result<PathBuf> {
        let staging = self.staging_dir();
        remove_dir_if_exists(&staging)?;
        ensure_directory(&staging)?;
        Ok(staging)
    }

    pub fn discard_staging(&self) {
        if let Err(err) = remove_dir_if_exists(&self.staging_dir()) {
            warn!(collection = %self.name, error = %err, "failed to remove staging directory");
        }
    }

    /// Swaps the staging directory in as the live collection. Earlier evaluation artifacts
    /// move along with it. The previous live directory is only removed after the swap.
    pub fn commit_staging(&self) -> Result<()> {
        let live = self.dir();
        let staging = self.staging_dir();
        let retired = self.retired_dir();

        let live_eval = live.join(EVAL_DIR);
        let staged_eval = staging.join(EVAL_DIR);
        if live_eval.is_dir() && !staged_eval.exists() {
            fs::rename(&live_eval, &staged_eval)?;
        }

        remove_dir_if_exists(&retired)?;
        let had_live = live.is_dir();
        if had_live {
            fs::rename(&live, &retired)?;
        }

        if let Err(err) = fs::rename(&staging, &live) {
            if had_live {
                fs::rename(&retired, &live)?;
            }
            return Err(err.into());
        }

        if let Err(err) = remove_dir_if_exists(&retired) {
            warn!(collection = %self.name, error = %err, "failed to remove retired collection");
        }
        Ok(())
    }
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|character| character.is_alphanumeric() || matches!(character, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(RagError::InvalidRequest(format!(
            "collection name '{name}' must be a single path component of letters, digits, '_', '-' or '.'"
        )))
    }
}

pub fn resolve_collection_name(
    explicit: Option<&str>,
    run_id: Option<i64>,
    source_id: Option<i64>,
) -> Result<String> {
    let name = match explicit.map(str::trim).filter(|value| !value.is_empty()) {
        Some(name) => name.to_string(),
        None => match (run_id, source_id) {
            (Some(run_id), _) => format!("run_{run_id}"),
            (None, Some(source_id)) => format!("source_{source_id}"),
            (None, None) => DEFAULT_COLLECTION.to_string(),
        },
    };
    validate_collection_name(&name)?;
    Ok(name)
}

/// Every committed collection under the models directory, ordered by store then name.
pub fn list_collections(models_dir: &Path) -> Result<Vec<IndexMeta>> {
    let mut out = Vec::<IndexMeta>::new();

    for store in StoreKind::ALL {
        let store_dir = models_dir.join(store.as_str());
        let entries = match fs::read_dir(&store_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };

        let mut metas = Vec::<IndexMeta>::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match read_json::<IndexMeta>(&entry.path().join(META_FILE)) {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "unreadable index meta");
                }
            }
        }
        metas.sort_by(|left, right| left.collection.cmp(&right.collection));
        out.extend(metas);
    }

    Ok(out)
}

/// Exclusive build lock for one collection; released on drop.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(layout: &CollectionLayout) -> Result<Self> {
        let path = layout.lock_path();
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(RagError::CollectionLocked { path });
            }
            Err(err) => return Err(err.into()),
        };
        writeln!(file, "pid={} acquired_at={}", std::process::id(), now_utc_string())?;

        Ok(Self { path })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %err, "failed to release build lock");
        }
    }
}
