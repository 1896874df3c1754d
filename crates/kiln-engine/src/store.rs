//! Content-addressed artifact store shared across invocations.
//!
//! Layout under the cache root:
//!
//! ```text
//! cas/<key[0:2]>/<key>/manifest       binary output list
//! cas/<key[0:2]>/<key>/metadata.json  build provenance
//! blobs/<hash[0:2]>/<hash>            read-only output contents
//! tmp/                                staging area for new entries
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use kiln_config::MaterializeMode;
use kiln_util::fs::Filesystem;
use kiln_util::hash::{sha256_bytes, Digest};
use kiln_util::RepoPath;

use crate::error::EngineError;
use crate::rulekey::RuleKey;

/// Version written at the start of every manifest.
pub const MANIFEST_SCHEMA: u32 = 1;

const MANIFEST_FILE: &str = "manifest";
const METADATA_FILE: &str = "metadata.json";
const STALE_STAGING: Duration = Duration::from_secs(3600);

/// One output recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the action's output directory.
    pub path: RepoPath,
    pub hash: Digest,
    pub mode: u32,
}

/// Encode a manifest in its little-endian on-disk form.
///
/// # Errors
/// Returns an error if a path does not fit in a `u16` length or there are
/// more than `u32::MAX` entries.
pub fn encode_manifest(entries: &[ManifestEntry]) -> Result<Vec<u8>, EngineError> {
    let count = u32::try_from(entries.len()).map_err(|_| EngineError::Internal {
        message: format!("manifest with {} entries is too large", entries.len()),
    })?;
    let mut out = Vec::with_capacity(8 + entries.len() * 48);
    out.extend_from_slice(&MANIFEST_SCHEMA.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    for entry in entries {
        let path = entry.path.as_str().as_bytes();
        let len = u16::try_from(path.len()).map_err(|_| EngineError::Internal {
            message: format!("output path `{}` is too long for the manifest", entry.path),
        })?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(path);
        out.extend_from_slice(entry.hash.as_bytes());
        out.extend_from_slice(&entry.mode.to_le_bytes());
    }
    Ok(out)
}

/// Decode a manifest, rejecting anything malformed or trailing.
///
/// # Errors
/// Returns a description of the first problem found.
pub fn decode_manifest(bytes: &[u8]) -> Result<Vec<ManifestEntry>, String> {
    let mut reader = ByteReader { bytes, pos: 0 };
    let schema = u32::from_le_bytes(reader.array()?);
    if schema != MANIFEST_SCHEMA {
        return Err(format!("unsupported manifest schema {schema}"));
    }
    let count = u32::from_le_bytes(reader.array()?);
    let mut entries = Vec::new();
    for _ in 0..count {
        let len = usize::from(u16::from_le_bytes(reader.array()?));
        let raw = reader.take(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| "path is not UTF-8".to_owned())?;
        let path = RepoPath::new(text).map_err(|e| e.to_string())?;
        if path.is_root() || path.as_str() != text {
            return Err(format!("path `{text}` is not normalized"));
        }
        let hash = Digest::from_bytes(reader.array()?);
        let mode = u32::from_le_bytes(reader.array()?);
        entries.push(ManifestEntry { path, hash, mode });
    }
    if reader.pos != bytes.len() {
        return Err(format!("{} trailing bytes", bytes.len() - reader.pos));
    }
    Ok(entries)
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(len).ok_or("length overflow")?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let slice = self.take(N)?;
        <[u8; N]>::try_from(slice).map_err(|_| "short read".to_owned())
    }
}

/// Provenance stored next to every entry as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    pub target: String,
    pub rule_kind: String,
    pub argv: Vec<String>,
    /// Tool name to executable digest.
    pub tool_digests: BTreeMap<String, String>,
    /// Sandbox-relative input path to content digest.
    pub inputs: BTreeMap<String, String>,
    pub outputs: Vec<String>,
    pub duration_ms: u64,
    pub host: String,
    pub kiln_version: String,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depfile_key: Option<String>,
}

/// A file to be stored under `path` in an entry.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: RepoPath,
    pub source: PathBuf,
}

type LeaseTable = Arc<Mutex<HashMap<RuleKey, usize>>>;

/// Keeps an entry alive: eviction skips entries with live leases.
#[derive(Debug)]
struct Lease {
    key: RuleKey,
    table: LeaseTable,
}

impl Lease {
    fn acquire(key: RuleKey, table: &LeaseTable) -> Self {
        if let Ok(mut leases) = table.lock() {
            *leases.entry(key).or_insert(0) += 1;
        }
        Self {
            key,
            table: Arc::clone(table),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut leases) = self.table.lock() {
            if let Some(count) = leases.get_mut(&self.key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    leases.remove(&self.key);
                }
            }
        }
    }
}

/// A leased view of one cache entry.
#[derive(Debug)]
pub struct CacheEntry {
    key: RuleKey,
    dir: PathBuf,
    entries: Arc<[ManifestEntry]>,
    _lease: Lease,
}

impl CacheEntry {
    pub fn key(&self) -> RuleKey {
        self.key
    }

    /// Outputs recorded in the manifest.
    pub fn outputs(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Shared handle to the outputs, for the in-memory LRU.
    pub fn shared_outputs(&self) -> Arc<[ManifestEntry]> {
        Arc::clone(&self.entries)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Summary of one entry found on disk.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: RuleKey,
    /// Last lookup or store time.
    pub accessed: SystemTime,
    /// Sum of the entry's blob sizes.
    pub size_bytes: u64,
    /// The manifest could not be decoded.
    pub corrupt: bool,
    blobs: Vec<Digest>,
    own_bytes: u64,
}

/// Counts for `cache show`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub blobs: usize,
    pub total_bytes: u64,
}

/// What an eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub entries_removed: usize,
    pub blobs_removed: usize,
    pub bytes_freed: u64,
}

/// The durable content-addressed store.
pub struct ArtifactStore {
    root: PathBuf,
    fs: Arc<dyn Filesystem>,
    /// Stores and lookups hold the read side; eviction holds the write side.
    gc_lock: RwLock<()>,
    leases: LeaseTable,
    staging_counter: AtomicU64,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore").field("root", &self.root).finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Staging directories left behind by crashed writers are removed once
    /// they are an hour old.
    ///
    /// # Errors
    /// Returns an error if the directory skeleton cannot be created.
    pub fn open(root: &Path, fs: Arc<dyn Filesystem>) -> Result<Self, EngineError> {
        for sub in ["cas", "blobs", "tmp"] {
            kiln_util::fs::ensure_dir(&root.join(sub))?;
        }
        let store = Self {
            root: root.to_path_buf(),
            fs,
            gc_lock: RwLock::new(()),
            leases: Arc::new(Mutex::new(HashMap::new())),
            staging_counter: AtomicU64::new(0),
        };
        store.sweep_staging();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &RuleKey) -> PathBuf {
        self.root.join("cas").join(key.shard()).join(key.to_hex())
    }

    fn blob_path(&self, hash: &Digest) -> PathBuf {
        self.root.join("blobs").join(hash.shard()).join(hash.to_hex())
    }

    fn read_guard(&self) -> Result<std::sync::RwLockReadGuard<'_, ()>, EngineError> {
        self.gc_lock.read().map_err(|_| EngineError::Internal {
            message: "artifact store lock poisoned".to_owned(),
        })
    }

    fn write_guard(&self) -> Result<std::sync::RwLockWriteGuard<'_, ()>, EngineError> {
        self.gc_lock.write().map_err(|_| EngineError::Internal {
            message: "artifact store lock poisoned".to_owned(),
        })
    }

    /// Whether an entry for `key` currently has a live lease.
    pub fn is_leased(&self, key: &RuleKey) -> bool {
        self.leases
            .lock()
            .map(|leases| leases.contains_key(key))
            .unwrap_or(true)
    }

    /// Find the entry for `key`, leasing it and refreshing its access time.
    ///
    /// # Errors
    /// Returns [`EngineError::CacheCorrupt`] if the entry exists but its
    /// manifest is malformed or a blob is missing.
    pub fn lookup(&self, key: &RuleKey) -> Result<Option<CacheEntry>, EngineError> {
        let _guard = self.read_guard()?;
        let dir = self.entry_dir(key);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Ok(None);
        }
        let bytes = self.fs.read_bytes(&manifest_path)?;
        let entries = decode_manifest(&bytes).map_err(|message| EngineError::CacheCorrupt {
            key: key.to_hex(),
            message,
        })?;
        if let Some(missing) = entries.iter().find(|e| !self.blob_path(&e.hash).is_file()) {
            return Err(EngineError::CacheCorrupt {
                key: key.to_hex(),
                message: format!("blob for `{}` is missing", missing.path),
            });
        }
        let lease = Lease::acquire(*key, &self.leases);
        touch(&manifest_path);
        Ok(Some(CacheEntry {
            key: *key,
            dir,
            entries: entries.into(),
            _lease: lease,
        }))
    }

    /// Lease an entry whose manifest is already known, if it still exists.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn reacquire(
        &self,
        key: &RuleKey,
        entries: Arc<[ManifestEntry]>,
    ) -> Result<Option<CacheEntry>, EngineError> {
        let _guard = self.read_guard()?;
        let dir = self.entry_dir(key);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Ok(None);
        }
        let lease = Lease::acquire(*key, &self.leases);
        touch(&manifest_path);
        Ok(Some(CacheEntry {
            key: *key,
            dir,
            entries,
            _lease: lease,
        }))
    }

    /// Store `outputs` under `key`.
    ///
    /// Blobs are written first; the manifest and metadata are staged under
    /// `tmp/` and renamed into place, so readers never see a partial entry.
    /// An existing entry is left untouched.
    ///
    /// # Errors
    /// Returns an error if an output cannot be read or the entry cannot be
    /// written.
    pub fn store(
        &self,
        key: &RuleKey,
        outputs: &[OutputFile],
        metadata: &EntryMetadata,
    ) -> Result<Arc<[ManifestEntry]>, EngineError> {
        let _guard = self.read_guard()?;
        let dir = self.entry_dir(key);
        if dir.join(MANIFEST_FILE).is_file() {
            tracing::debug!(key = %key, "entry already stored");
            let bytes = self.fs.read_bytes(&dir.join(MANIFEST_FILE))?;
            let entries = decode_manifest(&bytes).map_err(|message| EngineError::CacheCorrupt {
                key: key.to_hex(),
                message,
            })?;
            return Ok(entries.into());
        }

        let mut entries = Vec::with_capacity(outputs.len());
        for output in outputs {
            // Symlinks are followed: the entry records the target's content.
            let data = self.fs.read_bytes(&output.source)?;
            let hash = sha256_bytes(&data);
            let mode = kiln_util::fs::file_mode(&output.source)?;
            let blob = self.blob_path(&hash);
            if !blob.is_file() {
                self.fs.write_atomic(&blob, &data)?;
                self.fs.set_mode(&blob, mode & !0o222)?;
            }
            entries.push(ManifestEntry {
                path: output.path.clone(),
                hash,
                mode,
            });
        }

        let manifest = encode_manifest(&entries)?;
        let meta_json = serde_json::to_vec_pretty(metadata).map_err(|e| EngineError::Metadata {
            message: e.to_string(),
        })?;

        let counter = self.staging_counter.fetch_add(1, Ordering::Relaxed);
        let staging = self
            .root
            .join("tmp")
            .join(format!("{}.{}.{counter}", key.to_hex(), std::process::id()));
        self.fs.make_dir_clean(&staging)?;
        self.fs.write_atomic(&staging.join(MANIFEST_FILE), &manifest)?;
        self.fs.write_atomic(&staging.join(METADATA_FILE), &meta_json)?;

        if let Some(parent) = dir.parent() {
            kiln_util::fs::ensure_dir(parent)?;
        }
        match std::fs::rename(&staging, &dir) {
            Ok(()) => {}
            // Another writer won the race; entries are immutable so theirs is as good.
            Err(_) if dir.join(MANIFEST_FILE).is_file() => {
                self.fs.remove_tree(&staging)?;
            }
            Err(source) => {
                self.fs.remove_tree(&staging).ok();
                return Err(EngineError::io(&dir, source));
            }
        }
        tracing::debug!(key = %key, outputs = entries.len(), "stored cache entry");
        Ok(entries.into())
    }

    /// Place every output of `entry` under `dest_dir`.
    ///
    /// In hard-link mode a blob is linked only if its read-only mode matches
    /// what the output should have; otherwise it is copied and its recorded
    /// mode restored.
    ///
    /// # Errors
    /// Returns an error if an output cannot be placed.
    pub fn materialize(
        &self,
        entry: &CacheEntry,
        dest_dir: &Path,
        mode: MaterializeMode,
    ) -> Result<(), EngineError> {
        for output in entry.outputs() {
            let blob = self.blob_path(&output.hash);
            let dest = output.path.to_path(dest_dir);
            let link = mode == MaterializeMode::Hardlink
                && kiln_util::fs::file_mode(&blob)? == output.mode & !0o222;
            kiln_util::fs::materialize(self.fs.as_ref(), &blob, &dest, link)?;
            if !link {
                self.fs.set_mode(&dest, output.mode)?;
            }
        }
        Ok(())
    }

    /// Read an entry's provenance.
    ///
    /// # Errors
    /// Returns [`EngineError::CacheEntryMissing`] if there is no entry, or
    /// [`EngineError::Metadata`] if the file cannot be parsed.
    pub fn read_metadata(&self, key: &RuleKey) -> Result<EntryMetadata, EngineError> {
        let path = self.entry_dir(key).join(METADATA_FILE);
        if !path.is_file() {
            return Err(EngineError::CacheEntryMissing { key: key.to_hex() });
        }
        let bytes = self.fs.read_bytes(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Metadata {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Every entry on disk, least recently accessed first.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn list_entries(&self) -> Result<Vec<EntryInfo>, EngineError> {
        let _guard = self.read_guard()?;
        Ok(self.scan()?.0)
    }

    /// Entry, blob, and byte counts.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        let _guard = self.read_guard()?;
        let (entries, blob_sizes) = self.scan()?;
        let own: u64 = entries.iter().map(|e| e.own_bytes).sum();
        Ok(StoreStats {
            entries: entries.len(),
            blobs: blob_sizes.len(),
            total_bytes: own.saturating_add(blob_sizes.values().sum::<u64>()),
        })
    }

    /// Remove every unleased entry matching `predicate`, then delete blobs
    /// no remaining entry references.
    ///
    /// # Errors
    /// Returns an error if the store cannot be scanned or modified.
    pub fn evict(&self, predicate: impl Fn(&EntryInfo) -> bool) -> Result<EvictionReport, EngineError> {
        let _guard = self.write_guard()?;
        let (entries, blob_sizes) = self.scan()?;
        let victims: Vec<&EntryInfo> = entries
            .iter()
            .filter(|e| predicate(*e) && !self.is_leased(&e.key))
            .collect();
        self.remove_entries(&entries, &victims, &blob_sizes)
    }

    /// Evict least recently accessed entries until the store fits in
    /// `max_bytes`. Leased entries are kept even if that leaves the store
    /// over budget.
    ///
    /// # Errors
    /// Returns an error if the store cannot be scanned or modified.
    pub fn evict_to_size(&self, max_bytes: u64) -> Result<EvictionReport, EngineError> {
        let _guard = self.write_guard()?;
        let (entries, blob_sizes) = self.scan()?;

        let mut refs: HashMap<Digest, usize> = HashMap::new();
        for entry in &entries {
            for blob in &entry.blobs {
                *refs.entry(*blob).or_insert(0) += 1;
            }
        }
        let own: u64 = entries.iter().map(|e| e.own_bytes).sum();
        let mut total = own.saturating_add(blob_sizes.values().sum::<u64>());
        if total <= max_bytes {
            return Ok(EvictionReport::default());
        }

        let mut victims = Vec::new();
        for entry in &entries {
            if total <= max_bytes {
                break;
            }
            if self.is_leased(&entry.key) {
                continue;
            }
            total = total.saturating_sub(entry.own_bytes);
            for blob in unique(&entry.blobs) {
                if let Some(count) = refs.get_mut(&blob) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        total = total.saturating_sub(blob_sizes.get(&blob).copied().unwrap_or(0));
                    }
                }
            }
            victims.push(entry);
        }
        let report = self.remove_entries(&entries, &victims, &blob_sizes)?;
        tracing::info!(
            entries = report.entries_removed,
            blobs = report.blobs_removed,
            bytes = report.bytes_freed,
            "evicted cache entries"
        );
        Ok(report)
    }

    /// Caller holds the write lock.
    fn remove_entries(
        &self,
        all: &[EntryInfo],
        victims: &[&EntryInfo],
        blob_sizes: &HashMap<Digest, u64>,
    ) -> Result<EvictionReport, EngineError> {
        let mut report = EvictionReport::default();
        let removed: HashSet<RuleKey> = victims.iter().map(|v| v.key).collect();
        for victim in victims {
            self.fs.remove_tree(&self.entry_dir(&victim.key))?;
            report.entries_removed += 1;
            report.bytes_freed = report.bytes_freed.saturating_add(victim.own_bytes);
        }

        let live: HashSet<Digest> = all
            .iter()
            .filter(|e| !removed.contains(&e.key))
            .flat_map(|e| e.blobs.iter().copied())
            .collect();
        for (blob, size) in blob_sizes {
            if live.contains(blob) {
                continue;
            }
            let path = self.blob_path(blob);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    report.blobs_removed += 1;
                    report.bytes_freed = report.bytes_freed.saturating_add(*size);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(EngineError::io(&path, source)),
            }
        }
        Ok(report)
    }

    /// Caller holds either side of the lock.
    fn scan(&self) -> Result<(Vec<EntryInfo>, HashMap<Digest, u64>), EngineError> {
        let mut blob_sizes = HashMap::new();
        for (name, path) in children(&self.root.join("blobs"))?
            .into_iter()
            .flat_map(|(_, shard)| children(&shard).unwrap_or_default())
        {
            let Ok(hash) = name.parse::<Digest>() else {
                continue;
            };
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            blob_sizes.insert(hash, size);
        }

        let mut entries = Vec::new();
        for (_, shard) in children(&self.root.join("cas"))? {
            for (name, dir) in children(&shard)? {
                let Ok(key) = name.parse::<RuleKey>() else {
                    continue;
                };
                let manifest_path = dir.join(MANIFEST_FILE);
                let accessed = std::fs::metadata(&manifest_path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let own_bytes = kiln_util::fs::dir_size(&dir)?;
                let decoded = std::fs::read(&manifest_path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| decode_manifest(&bytes));
                let (blobs, corrupt) = match decoded {
                    Ok(list) => (list.iter().map(|e| e.hash).collect::<Vec<_>>(), false),
                    Err(message) => {
                        tracing::warn!(key = %key, error = %message, "corrupt cache entry");
                        (Vec::new(), true)
                    }
                };
                let size_bytes = unique(&blobs)
                    .iter()
                    .map(|b| blob_sizes.get(b).copied().unwrap_or(0))
                    .sum();
                entries.push(EntryInfo {
                    key,
                    accessed,
                    size_bytes,
                    corrupt,
                    blobs,
                    own_bytes,
                });
            }
        }
        entries.sort_by(|a, b| a.accessed.cmp(&b.accessed).then(a.key.cmp(&b.key)));
        Ok((entries, blob_sizes))
    }

    fn sweep_staging(&self) {
        let Ok(stale) = children(&self.root.join("tmp")) else {
            return;
        };
        let now = SystemTime::now();
        for (_, path) in stale {
            let old = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age > STALE_STAGING);
            if old {
                if let Err(e) = self.fs.remove_tree(&path) {
                    tracing::debug!(path = %path.display(), error = %e, "cannot remove stale staging dir");
                }
            }
        }
    }
}

fn unique(blobs: &[Digest]) -> Vec<Digest> {
    let mut out = blobs.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Directory children as (name, path), sorted. A missing directory is empty.
fn children(dir: &Path) -> Result<Vec<(String, PathBuf)>, EngineError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(EngineError::io(dir, source)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| EngineError::io(dir, source))?;
        if let Some(name) = entry.file_name().to_str() {
            out.push((name.to_owned(), entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

/// Refresh the access time used for LRU eviction.
fn touch(path: &Path) {
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "cannot refresh access time");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use kiln_util::fs::LocalFs;
    use kiln_util::hash::sha256_bytes;

    fn key(seed: &str) -> RuleKey {
        RuleKey::from_digest(sha256_bytes(seed.as_bytes()))
    }

    fn metadata(key: &RuleKey) -> EntryMetadata {
        EntryMetadata {
            key: key.to_hex(),
            target: "root//pkg:gen".to_owned(),
            rule_kind: "genrule".to_owned(),
            argv: vec!["-c".to_owned(), "true".to_owned()],
            tool_digests: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: vec!["out.txt".to_owned()],
            duration_ms: 12,
            host: "test".to_owned(),
            kiln_version: "0.0.0".to_owned(),
            created_at: 0,
            depfile_key: None,
        }
    }

    fn open(dir: &Path) -> ArtifactStore {
        ArtifactStore::open(dir, Arc::new(LocalFs)).unwrap()
    }

    fn output(dir: &Path, rel: &str, content: &[u8]) -> OutputFile {
        let source = dir.join(rel);
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, content).unwrap();
        OutputFile {
            path: RepoPath::new(rel).unwrap(),
            source,
        }
    }

    #[test]
    fn manifest_rejects_garbage() {
        let entries = vec![ManifestEntry {
            path: RepoPath::new("a/b.txt").unwrap(),
            hash: sha256_bytes(b"x"),
            mode: 0o644,
        }];
        let bytes = encode_manifest(&entries).unwrap();
        assert_eq!(decode_manifest(&bytes).unwrap(), entries);
        assert_eq!(bytes.len(), 4 + 4 + 2 + 7 + 32 + 4);

        assert!(decode_manifest(&bytes[..bytes.len() - 1]).is_err());
        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(decode_manifest(&trailing).is_err());
        let mut wrong_schema = bytes;
        wrong_schema[0] = 2;
        assert!(decode_manifest(&wrong_schema).unwrap_err().contains("schema"));
    }

    #[test]
    fn store_lookup_materialize_is_byte_identical() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let k = key("one");

        let outputs = vec![
            output(work.path(), "out.txt", b"hello"),
            output(work.path(), "nested/data.bin", &[0, 1, 2, 255]),
            output(work.path(), "empty", b""),
        ];
        kiln_util::fs::set_file_mode(&outputs[1].source, 0o755).unwrap();
        store.store(&k, &outputs, &metadata(&k)).unwrap();

        for mode in [MaterializeMode::Copy, MaterializeMode::Hardlink] {
            let dest = tempfile::tempdir().unwrap();
            let entry = store.lookup(&k).unwrap().unwrap();
            assert_eq!(entry.outputs().len(), 3);
            store.materialize(&entry, dest.path(), mode).unwrap();
            assert_eq!(fs::read(dest.path().join("out.txt")).unwrap(), b"hello");
            assert_eq!(fs::read(dest.path().join("nested/data.bin")).unwrap(), [0, 1, 2, 255]);
            assert_eq!(fs::read(dest.path().join("empty")).unwrap(), b"");
            let exec = kiln_util::fs::file_mode(&dest.path().join("nested/data.bin")).unwrap();
            assert_eq!(exec & 0o111, 0o111);
        }
    }

    #[cfg(unix)]
    #[test]
    fn blobs_are_read_only() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let k = key("ro");
        let stored = store
            .store(&k, &[output(work.path(), "f", b"data")], &metadata(&k))
            .unwrap();
        let blob = store.blob_path(&stored[0].hash);
        assert_eq!(kiln_util::fs::file_mode(&blob).unwrap() & 0o222, 0);
    }

    /// Local filesystem that counts reads of each path.
    #[derive(Default)]
    struct CountingReads {
        reads: Mutex<HashMap<PathBuf, usize>>,
    }

    impl Filesystem for CountingReads {
        fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, kiln_util::error::UtilError> {
            *self.reads.lock().unwrap().entry(path.to_path_buf()).or_default() += 1;
            LocalFs.read_bytes(path)
        }
        fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), kiln_util::error::UtilError> {
            LocalFs.write_atomic(path, data)
        }
        fn hard_link(&self, src: &Path, dest: &Path) -> Result<(), kiln_util::error::UtilError> {
            LocalFs.hard_link(src, dest)
        }
        fn copy(&self, src: &Path, dest: &Path) -> Result<(), kiln_util::error::UtilError> {
            LocalFs.copy(src, dest)
        }
        fn remove_tree(&self, path: &Path) -> Result<(), kiln_util::error::UtilError> {
            LocalFs.remove_tree(path)
        }
        fn make_dir_clean(&self, path: &Path) -> Result<(), kiln_util::error::UtilError> {
            LocalFs.make_dir_clean(path)
        }
        fn set_mode(&self, path: &Path, mode: u32) -> Result<(), kiln_util::error::UtilError> {
            LocalFs.set_mode(path, mode)
        }
    }

    #[test]
    fn outputs_are_read_once_and_blob_named_by_content() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let counting = Arc::new(CountingReads::default());
        let store = ArtifactStore::open(cache.path(), Arc::clone(&counting) as Arc<dyn Filesystem>).unwrap();
        let k = key("once");
        let out = output(work.path(), "out.txt", b"payload");
        let stored = store.store(&k, std::slice::from_ref(&out), &metadata(&k)).unwrap();

        assert_eq!(counting.reads.lock().unwrap().get(&out.source), Some(&1));
        assert_eq!(stored[0].hash, sha256_bytes(b"payload"));
        let blob = store.blob_path(&stored[0].hash);
        assert_eq!(sha256_bytes(&fs::read(&blob).unwrap()), stored[0].hash);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_outputs_are_dereferenced() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let real = output(work.path(), "real.txt", b"target content");
        let link = work.path().join("link.txt");
        std::os::unix::fs::symlink(&real.source, &link).unwrap();

        let k = key("link");
        let out = OutputFile {
            path: RepoPath::new("link.txt").unwrap(),
            source: link,
        };
        store.store(&k, &[out], &metadata(&k)).unwrap();
        let entry = store.lookup(&k).unwrap().unwrap();
        let dest = tempfile::tempdir().unwrap();
        store.materialize(&entry, dest.path(), MaterializeMode::Copy).unwrap();
        let placed = dest.path().join("link.txt");
        assert!(!fs::symlink_metadata(&placed).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(placed).unwrap(), b"target content");
    }

    #[test]
    fn second_store_is_a_no_op() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let k = key("immutable");
        store.store(&k, &[output(work.path(), "f", b"first")], &metadata(&k)).unwrap();
        let again = store
            .store(&k, &[output(work.path(), "f", b"second")], &metadata(&k))
            .unwrap();
        assert_eq!(again[0].hash, sha256_bytes(b"first"));

        let dest = tempfile::tempdir().unwrap();
        let entry = store.lookup(&k).unwrap().unwrap();
        store.materialize(&entry, dest.path(), MaterializeMode::Copy).unwrap();
        assert_eq!(fs::read(dest.path().join("f")).unwrap(), b"first");
        assert!(children(&cache.path().join("tmp")).unwrap().is_empty());
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let cache = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        assert!(store.lookup(&key("nothing")).unwrap().is_none());
        assert!(matches!(
            store.read_metadata(&key("nothing")).unwrap_err(),
            EngineError::CacheEntryMissing { .. }
        ));
    }

    #[test]
    fn corrupt_manifest_is_reported() {
        let cache = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let k = key("bad");
        let dir = store.entry_dir(&k);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), b"nope").unwrap();
        assert!(matches!(
            store.lookup(&k).unwrap_err(),
            EngineError::CacheCorrupt { .. }
        ));
        // Corrupt entries are visible to eviction.
        let report = store.evict(|info| info.corrupt).unwrap();
        assert_eq!(report.entries_removed, 1);
        assert!(store.lookup(&k).unwrap().is_none());
    }

    #[test]
    fn metadata_round_trips_through_disk() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let k = key("meta");
        let mut meta = metadata(&k);
        meta.depfile_key = Some(key("dep").to_hex());
        store.store(&k, &[output(work.path(), "f", b"x")], &meta).unwrap();
        assert_eq!(store.read_metadata(&k).unwrap(), meta);
    }

    #[test]
    fn leased_entries_survive_eviction_and_shared_blobs_are_kept() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let (a, b, c) = (key("a"), key("b"), key("c"));
        store.store(&a, &[output(work.path(), "f", b"shared")], &metadata(&a)).unwrap();
        store.store(&b, &[output(work.path(), "g", b"shared")], &metadata(&b)).unwrap();
        store.store(&c, &[output(work.path(), "h", b"only c")], &metadata(&c)).unwrap();

        let held = store.lookup(&a).unwrap().unwrap();
        let report = store.evict(|_| true).unwrap();
        assert_eq!(report.entries_removed, 2);
        // "shared" is still referenced by the leased entry; "only c" is gone.
        assert_eq!(report.blobs_removed, 1);
        assert!(store.lookup(&b).unwrap().is_none());

        let dest = tempfile::tempdir().unwrap();
        store.materialize(&held, dest.path(), MaterializeMode::Hardlink).unwrap();
        assert_eq!(fs::read(dest.path().join("f")).unwrap(), b"shared");

        drop(held);
        assert!(!store.is_leased(&a));
        assert_eq!(store.evict(|_| true).unwrap().entries_removed, 1);
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn evict_to_size_removes_oldest_first() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let keys: Vec<RuleKey> = (0..3).map(|i| key(&format!("k{i}"))).collect();
        for (i, k) in keys.iter().enumerate() {
            let body = vec![u8::try_from(i).unwrap(); 1000];
            store.store(k, &[output(work.path(), "f", &body)], &metadata(k)).unwrap();
            // Distinct, ordered access times.
            let manifest = store.entry_dir(k).join(MANIFEST_FILE);
            let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + u64::try_from(i).unwrap());
            fs::File::options().write(true).open(manifest).unwrap().set_modified(when).unwrap();
        }

        let before = store.stats().unwrap();
        assert_eq!(before.entries, 3);
        assert!(store.evict_to_size(before.total_bytes).unwrap().entries_removed == 0);

        let report = store.evict_to_size(before.total_bytes - 1).unwrap();
        assert_eq!(report.entries_removed, 1);
        assert!(store.lookup(&keys[0]).unwrap().is_none());
        assert!(store.lookup(&keys[1]).unwrap().is_some());
        assert!(store.lookup(&keys[2]).unwrap().is_some());
    }

    #[test]
    fn list_entries_reports_sizes() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = open(cache.path());
        let k = key("sized");
        store
            .store(&k, &[output(work.path(), "a", b"12345"), output(work.path(), "b", b"12345")], &metadata(&k))
            .unwrap();
        let listed = store.list_entries().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, k);
        // Identical contents share one blob.
        assert_eq!(listed[0].size_bytes, 5);
        assert_eq!(store.stats().unwrap().blobs, 1);
    }
}
