use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context as _, bail};
use tokio::sync::RwLock;

use crate::{
    matcher::TapeMatcher,
    options::Options,
    render::{self, TAPE_EXTENSION},
    tape::Tape,
};

/// Flat key/blob storage. Keys are relative, `/`-separated paths.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Every key, recursively, in sorted order.
    fn list(&self) -> anyhow::Result<Vec<String>>;
    fn read(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    /// Writes `data`, creating missing parent directories.
    fn write(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            bail!("tape key `{key}` escapes the tape directory");
        }
        Ok(self.root.join(relative))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> anyhow::Result<()> {
        let entries =
            fs::read_dir(dir).with_context(|| format!("read tape dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read tape dir entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {}", path.display()))?;
            if file_type.is_dir() {
                self.collect_keys(&path, keys)?;
                continue;
            }
            let relative = path
                .strip_prefix(&self.root)
                .with_context(|| format!("relativize {}", path.display()))?;
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self) -> anyhow::Result<Vec<String>> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create tape dir {}", self.root.display()))?;
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn read(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path).with_context(|| format!("read tape {}", path.display()))
    }

    fn write(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create tape dir {}", parent.display()))?;
        }
        fs::write(&path, data).with_context(|| format!("write tape {}", path.display()))
    }
}

/// In-memory blob store, handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self) -> anyhow::Result<Vec<String>> {
        let blobs = self
            .blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(blobs.keys().cloned().collect())
    }

    fn read(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let blobs = self
            .blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        blobs
            .get(key)
            .cloned()
            .with_context(|| format!("tape `{key}` not found"))
    }

    fn write(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}

/// Every tape known to this session, in load order.
///
/// `find` and `save` both take the write lock, so a save never interleaves with a lookup and
/// the default tape name is derived from a count nobody else can change meanwhile.
#[derive(Debug)]
pub struct TapeStore {
    options: Arc<Options>,
    blobs: Arc<dyn BlobStore>,
    tapes: RwLock<Vec<Tape>>,
}

impl TapeStore {
    /// Store backed by the tape directory in `options.path`.
    pub fn new(options: Arc<Options>) -> Self {
        let blobs = Arc::new(FsBlobStore::new(options.path.clone()));
        Self::with_blob_store(options, blobs)
    }

    pub fn with_blob_store(options: Arc<Options>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            options,
            blobs,
            tapes: RwLock::new(Vec::new()),
        }
    }

    /// Reads every tape from the backing store. Unreadable tapes are logged and skipped.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let blobs = Arc::clone(&self.blobs);
        let options = Arc::clone(&self.options);
        let loaded = tokio::task::spawn_blocking(move || load_blocking(blobs.as_ref(), &options))
            .await
            .context("join tape load task")??;

        let count = loaded.len();
        *self.tapes.write().await = loaded;
        tracing::info!(tapes = count, "loaded tapes");
        Ok(count)
    }

    /// First tape in load order that matches `candidate`; marks it used.
    pub async fn find(&self, candidate: &Tape) -> Option<Tape> {
        let matcher = TapeMatcher::new(&self.options);
        let mut tapes = self.tapes.write().await;
        let found = tapes.iter_mut().find(|stored| {
            tracing::debug!(tape = %stored.display_name(), "comparing against tape");
            matcher.same_as(candidate, stored)
        })?;
        found.used = true;
        tracing::info!(
            url = %candidate.req.url,
            tape = %found.display_name(),
            "found matching tape"
        );
        Some(found.clone())
    }

    /// Persists `tape`, naming it first if it has never been saved.
    ///
    /// A tape whose path is already known replaces that entry, so saving twice never appends
    /// twice. The session only sees the tape once its blob is written.
    pub async fn save(&self, tape: &mut Tape) -> anyhow::Result<()> {
        let mut tapes = self.tapes.write().await;
        let mut saved = tape.clone();
        saved.is_new = true;
        saved.used = true;
        let key = match saved.path.as_deref() {
            Some(path) => path.to_owned(),
            None => self.next_tape_path(&tapes, &saved),
        };
        saved.path = Some(key.clone());

        tracing::info!(url = %saved.req.url, tape = %key, "saving tape");
        let document = render::render(&saved).context("render tape")?;
        let blobs = Arc::clone(&self.blobs);
        let blob_key = key.clone();
        tokio::task::spawn_blocking(move || blobs.write(&blob_key, document.as_bytes()))
            .await
            .context("join tape write task")??;

        match tapes
            .iter_mut()
            .find(|stored| stored.path.as_deref() == Some(key.as_str()))
        {
            Some(stored) => *stored = saved.clone(),
            None => tapes.push(saved.clone()),
        }
        *tape = saved;
        Ok(())
    }

    pub async fn has_tape_been_used(&self, path: &str) -> bool {
        self.tapes
            .read()
            .await
            .iter()
            .any(|tape| tape.used && tape.path.as_deref() == Some(path))
    }

    pub async fn reset_tape_usage(&self) {
        for tape in self.tapes.write().await.iter_mut() {
            tape.used = false;
        }
    }

    pub async fn tapes(&self) -> Vec<Tape> {
        self.tapes.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tapes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tapes.read().await.is_empty()
    }

    fn next_tape_path(&self, tapes: &[Tape], tape: &Tape) -> String {
        let taken = |candidate: &str| {
            tapes
                .iter()
                .any(|stored| stored.path.as_deref() == Some(candidate))
        };

        match self.options.tape_name_generator.as_ref() {
            Some(generator) => {
                let path = normalize_tape_path(&generator(tapes.len(), tape));
                if taken(&path) {
                    tracing::warn!(tape = %path, "generated tape name is taken; replacing that tape");
                }
                path
            }
            None => {
                let mut sequence = tapes.len();
                loop {
                    let candidate = normalize_tape_path(&format!("unnamed-{sequence}"));
                    if !taken(&candidate) {
                        return candidate;
                    }
                    sequence += 1;
                }
            }
        }
    }
}

fn load_blocking(blobs: &dyn BlobStore, options: &Options) -> anyhow::Result<Vec<Tape>> {
    let mut tapes = Vec::new();
    for key in blobs.list()? {
        let parsed = blobs.read(&key).and_then(|data| {
            let document = String::from_utf8(data).context("tape is not UTF-8")?;
            render::parse(&document, options).map_err(anyhow::Error::from)
        });
        match parsed {
            Ok(mut tape) => {
                tape.path = Some(key);
                tapes.push(tape);
            }
            Err(err) => {
                tracing::warn!(tape = %key, "skipping unreadable tape: {err:#}");
            }
        }
    }
    Ok(tapes)
}

/// Relative, `/`-separated, `.json5`-suffixed.
fn normalize_tape_path(raw: &str) -> String {
    let mut path = raw
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");
    if !path.ends_with(TAPE_EXTENSION) {
        path.push_str(TAPE_EXTENSION);
    }
    path
}
