use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use bytes::Bytes;
use heed::types::Bytes as RawBytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, StoreBackend, StoreConfig};

/// Failure of the backend itself. A missing key is `Ok(None)`, never this.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} store unavailable: {message}")]
    Unavailable { kind: &'static str, message: String },
    #[error("{kind} store corrupted: {message}")]
    Corrupted { kind: &'static str, message: String },
}

/// Read-only byte keyed lookup shared by every worker.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    fn kind(&self) -> &'static str;
}

const LMDB_MAX_DBS: u32 = 64;

/// Which file a path pointed at when it was opened. A replaced file (rename
/// over the old one) gets a new identity while in-place writes keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    #[cfg(not(unix))]
    created: Option<SystemTime>,
}

impl FileIdentity {
    fn of(meta: &fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                dev: meta.dev(),
                ino: meta.ino(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                created: meta.created().ok(),
            }
        }
    }
}

struct CachedEnv {
    identity: FileIdentity,
    subdir: bool,
    env: Env,
}

// heed keeps one environment per canonical path for the whole process, so a
// reload must hand back the same handle unless the file behind the path was
// replaced or the layout flag changed.
static OPENED_ENVS: OnceLock<Mutex<FxHashMap<PathBuf, CachedEnv>>> = OnceLock::new();
static ALIAS_GENERATION: AtomicU64 = AtomicU64::new(0);

fn open_env(path: &Path, subdir: bool) -> Result<Env, heed::Error> {
    let canonical = fs::canonicalize(path)?;
    let data_file = if subdir {
        canonical.join("data.mdb")
    } else {
        canonical.clone()
    };
    let identity = FileIdentity::of(&fs::metadata(&data_file)?);

    let envs = OPENED_ENVS.get_or_init(|| Mutex::new(FxHashMap::default()));
    let mut envs = envs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(cached) = envs.get(&canonical) {
        if cached.identity == identity && cached.subdir == subdir {
            return Ok(cached.env.clone());
        }
        debug!(target = "kvs", path = %canonical.display(), "lmdb file replaced, reopening");
    }
    envs.remove(&canonical);

    // stores built from an earlier config may still hold the old file open
    // under this path; the new file is then opened through a private alias
    let env = if heed::env_closing_event(&canonical).is_some() {
        open_env_alias(&canonical, &data_file, subdir)?
    } else {
        open_env_at(&canonical, subdir, EnvFlags::empty())?
    };
    envs.insert(
        canonical,
        CachedEnv {
            identity,
            subdir,
            env: env.clone(),
        },
    );
    Ok(env)
}

fn open_env_at(path: &Path, subdir: bool, extra: EnvFlags) -> Result<Env, heed::Error> {
    let mut flags = extra;
    if !subdir {
        flags |= EnvFlags::NO_SUB_DIR;
    }
    let mut options = EnvOpenOptions::new();
    options.max_dbs(LMDB_MAX_DBS);
    // SAFETY: NO_SUB_DIR only changes file naming. READ_ONLY | NO_LOCK is only
    // passed for aliases of a file that was swapped in whole and is never
    // written through that name.
    unsafe {
        options.flags(flags);
    }
    // SAFETY: every open goes through open_env, which serializes opens and
    // reuses the live handle for a path (see OPENED_ENVS).
    unsafe { options.open(path) }
}

/// Open `data_file` under a fresh hard-linked name next to it. The alias is
/// removed once mapped; the mapping outlives the name.
fn open_env_alias(canonical: &Path, data_file: &Path, subdir: bool) -> Result<Env, heed::Error> {
    let generation = ALIAS_GENERATION.fetch_add(1, Ordering::Relaxed);
    let file_name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let alias = canonical.with_file_name(format!(
        ".{file_name}.{}.{generation}",
        std::process::id()
    ));

    if subdir {
        fs::create_dir(&alias)?;
        fs::hard_link(data_file, alias.join("data.mdb"))?;
    } else {
        fs::hard_link(data_file, &alias)?;
    }
    let opened = open_env_at(&alias, subdir, EnvFlags::READ_ONLY | EnvFlags::NO_LOCK);
    let removed = if subdir {
        fs::remove_dir_all(&alias)
    } else {
        fs::remove_file(&alias)
    };
    if let Err(err) = removed {
        debug!(target = "kvs", alias = %alias.display(), error = %err, "lmdb alias not removed");
    }
    opened
}

/// LMDB backed store. The environment is shared across threads; every lookup
/// runs in its own short read transaction.
pub struct LmdbStore {
    env: Env,
    db: Database<RawBytes, RawBytes>,
    path: PathBuf,
    db_name: String,
}

impl LmdbStore {
    pub fn open(path: &Path, db_name: &str, subdir: bool) -> Result<Self, ConfigError> {
        let open_err = |message: String| ConfigError::StoreOpen {
            path: path.display().to_string(),
            message,
        };
        if !path.exists() {
            return Err(open_err("no such file or directory".to_string()));
        }

        let env = open_env(path, subdir).map_err(|e| open_err(e.to_string()))?;
        let rtxn = env.read_txn().map_err(|e| open_err(e.to_string()))?;
        let name = if db_name.is_empty() { None } else { Some(db_name) };
        let db: Option<Database<RawBytes, RawBytes>> = env
            .open_database(&rtxn, name)
            .map_err(|e| open_err(e.to_string()))?;
        rtxn.commit().map_err(|e| open_err(e.to_string()))?;
        let db = db.ok_or_else(|| open_err(format!("database '{db_name}' not found")))?;

        Ok(Self {
            env,
            db,
            path: path.to_path_buf(),
            db_name: db_name.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

impl KeyValueStore for LmdbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        // LMDB rejects empty keys; nothing can be stored under one
        if key.is_empty() {
            return Ok(None);
        }
        let rtxn = self.env.read_txn().map_err(lmdb_error)?;
        let value = self
            .db
            .get(&rtxn, key)
            .map_err(lmdb_error)?
            .map(Bytes::copy_from_slice);
        Ok(value)
    }

    fn kind(&self) -> &'static str {
        "lmdb"
    }
}

fn lmdb_error(err: heed::Error) -> StoreError {
    match err {
        heed::Error::Mdb(heed::MdbError::Corrupted) | heed::Error::Mdb(heed::MdbError::Invalid) => {
            StoreError::Corrupted {
                kind: "lmdb",
                message: err.to_string(),
            }
        }
        other => StoreError::Unavailable {
            kind: "lmdb",
            message: other.to_string(),
        },
    }
}

struct CdbSnapshot {
    db: cdb::CDB,
    identity: FileIdentity,
    modified: Option<SystemTime>,
}

impl CdbSnapshot {
    fn load(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            db: cdb::CDB::open(path)?,
            identity: FileIdentity::of(&meta),
            modified: meta.modified().ok(),
        })
    }

    fn is_current(&self, meta: &fs::Metadata) -> bool {
        self.identity == FileIdentity::of(meta) && self.modified == meta.modified().ok()
    }
}

/// Constant database store. CDB files are rebuilt rather than updated, so the
/// file is checked for replacement at most once per refresh interval and
/// swapped in without blocking readers.
pub struct CdbStore {
    path: PathBuf,
    refresh: Option<Duration>,
    snapshot: ArcSwap<CdbSnapshot>,
    next_check: Mutex<Instant>,
}

impl CdbStore {
    /// A zero `refresh` never looks at the file again.
    pub fn open(path: &Path, refresh: Duration) -> Result<Self, ConfigError> {
        let snapshot = CdbSnapshot::load(path).map_err(|e| ConfigError::StoreOpen {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let refresh = (!refresh.is_zero()).then_some(refresh);
        Ok(Self {
            path: path.to_path_buf(),
            refresh,
            snapshot: ArcSwap::from_pointee(snapshot),
            next_check: Mutex::new(Instant::now() + refresh.unwrap_or_default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh_if_due(&self) {
        let Some(every) = self.refresh else {
            return;
        };
        // one reader checks; the others keep using the current snapshot
        let Ok(mut next_check) = self.next_check.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now < *next_check {
            return;
        }
        *next_check = now + every;

        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(target = "kvs", path = %self.path.display(), error = %err, "cdb file unavailable, keeping loaded copy");
                return;
            }
        };
        if self.snapshot.load().is_current(&meta) {
            return;
        }
        match CdbSnapshot::load(&self.path) {
            Ok(fresh) => {
                info!(target = "kvs", path = %self.path.display(), "cdb store reloaded");
                self.snapshot.store(Arc::new(fresh));
            }
            Err(err) => {
                warn!(target = "kvs", path = %self.path.display(), error = %err, "cdb reload failed, keeping loaded copy")
            }
        }
    }
}

impl KeyValueStore for CdbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.refresh_if_due();
        let snapshot = self.snapshot.load();
        match snapshot.db.find(key).next() {
            Some(Ok(value)) => Ok(Some(Bytes::from(value))),
            Some(Err(err)) => Err(cdb_error(err)),
            None => Ok(None),
        }
    }

    fn kind(&self) -> &'static str {
        "cdb"
    }
}

fn cdb_error(err: std::io::Error) -> StoreError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => StoreError::Corrupted {
            kind: "cdb",
            message: err.to_string(),
        },
        _ => StoreError::Unavailable {
            kind: "cdb",
            message: err.to_string(),
        },
    }
}

/// Stores declared in the configuration, by logical name.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: FxHashMap<String, Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.stores.iter().map(|(name, store)| (name, store.kind())))
            .finish()
    }
}

impl StoreRegistry {
    pub fn build(configs: &[StoreConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for cfg in configs {
            if cfg.name.is_empty() {
                return Err(ConfigError::EmptyStoreName);
            }
            if registry.stores.contains_key(&cfg.name) {
                return Err(ConfigError::DuplicateStore(cfg.name.clone()));
            }
            let store: Arc<dyn KeyValueStore> = match &cfg.backend {
                StoreBackend::Lmdb {
                    path,
                    db_name,
                    subdir,
                } => {
                    let store = LmdbStore::open(path, db_name, *subdir)?;
                    info!(
                        target = "kvs",
                        store = %cfg.name,
                        path = %store.path().display(),
                        db = %store.db_name(),
                        "lmdb store opened"
                    );
                    Arc::new(store)
                }
                StoreBackend::Cdb { path, refresh_secs } => {
                    let store = CdbStore::open(path, Duration::from_secs(*refresh_secs))?;
                    info!(
                        target = "kvs",
                        store = %cfg.name,
                        path = %store.path().display(),
                        refresh_secs = *refresh_secs,
                        "cdb store opened"
                    );
                    Arc::new(store)
                }
            };
            registry.stores.insert(cfg.name.clone(), store);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn KeyValueStore>, ConfigError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStore(name.to_string()))
    }

    #[cfg(test)]
    pub fn insert(&mut self, name: &str, store: Arc<dyn KeyValueStore>) {
        self.stores.insert(name.to_string(), store);
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }
}
