use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Named, time-bounded mutual exclusion across all cooperating instances.
///
/// `Ok(None)` from [`try_acquire`](LockProvider::try_acquire) means another
/// holder is active; it is never an error. A granted handle expires on its
/// own once the maximum hold elapses, whether or not it is released.
pub trait LockProvider: Clone + Send + Sync + 'static {
    /// Attempt to take the lock `name`, holding it for at least `at_least`
    /// and at most `at_most`.
    fn try_acquire(
        &self,
        name: &str,
        at_least: Duration,
        at_most: Duration,
    ) -> Result<Option<LockHandle>>;

    /// Release a previously granted handle. A handle whose maximum hold has
    /// elapsed may already belong to someone else; releasing it then is a
    /// no-op.
    fn release(&self, handle: &LockHandle) -> Result<()>;
}

/// Token representing one exclusive, time-bounded hold of a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Lock name the handle was granted for.
    pub name: String,
    /// Fencing token; a stale holder's release cannot touch a newer grant.
    pub token: u64,
}

/// Filesystem-backed lock provider used as the default engine.
///
/// One file per lock name under `root`. All instances contending for a lock
/// must share the directory.
#[derive(Clone)]
pub struct FsLock {
    root: PathBuf,
}

/// Default lock provider type exported by this crate (FS-backed).
pub type DefaultLock = FsLock;

/// Open an FS-backed lock provider rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultLock> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create lock dir {}", root.display()))?;
    Ok(FsLock { root })
}

/// On-disk state of one named lock, `bincode`-encoded.
#[derive(Serialize, Deserialize, Clone, Copy)]
struct LockRecord {
    token: u64,
    /// The name stays blocked until here even after an early release.
    min_until_ms: u64,
    /// Past here the record is stale and the name is reclaimable.
    max_until_ms: u64,
    released: bool,
}

impl LockRecord {
    fn blocks(&self, now: u64) -> bool {
        if now >= self.max_until_ms {
            return false;
        }
        if self.released {
            now < self.min_until_ms
        } else {
            true
        }
    }
}

/* --------------------- impl FsLock --------------------- */

impl FsLock {
    fn path_for(&self, name: &str) -> PathBuf {
        // Windows-safe: map arbitrary name bytes to a hex file name.
        let mut fname = String::with_capacity(name.len() * 2);
        for &b in name.as_bytes() {
            let hi = (b >> 4) & 0xF;
            let lo = b & 0xF;
            fname.push(hex_digit(hi));
            fname.push(hex_digit(lo));
        }
        self.root.join(fname)
    }

    fn read_record(&self, name: &str) -> Option<LockRecord> {
        let bytes = fs::read(self.path_for(name)).ok()?;
        match bincode::deserialize::<LockRecord>(&bytes) {
            Ok(rec) => Some(rec),
            Err(e) => {
                // Unreadable record: treat the name as reclaimable.
                warn!("lock {} record unreadable: {}", name, e);
                None
            }
        }
    }

    fn write_record(&self, name: &str, rec: &LockRecord) -> Result<()> {
        let path = self.path_for(name);
        let buf = bincode::serialize(rec).with_context(|| "bincode serialize")?;
        // Best-effort atomic-ish write: write temp then rename.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn next_token() -> u64 {
    // Unique enough across processes: wall clock plus a per-process sequence.
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    (now_ms() << 16) | (seq & 0xFFFF)
}

impl LockProvider for FsLock {
    fn try_acquire(
        &self,
        name: &str,
        at_least: Duration,
        at_most: Duration,
    ) -> Result<Option<LockHandle>> {
        let now = now_ms();
        if let Some(rec) = self.read_record(name) {
            if rec.blocks(now) {
                return Ok(None);
            }
        }
        let rec = LockRecord {
            token: next_token(),
            min_until_ms: now + at_least.as_millis() as u64,
            max_until_ms: now + at_most.as_millis() as u64,
            released: false,
        };
        self.write_record(name, &rec)?;
        Ok(Some(LockHandle { name: name.to_string(), token: rec.token }))
    }

    fn release(&self, handle: &LockHandle) -> Result<()> {
        let Some(rec) = self.read_record(&handle.name) else {
            return Ok(());
        };
        if rec.token != handle.token || rec.released {
            // Reclaimed or already released; nothing to do.
            return Ok(());
        }
        self.write_record(&handle.name, &LockRecord { released: true, ..rec })
    }
}
