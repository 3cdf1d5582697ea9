//! Durable node-local record of IP assignments and cached lease blocks
//!
//! Layout under `dataDir/<network>/`:
//!
//! - one file per assigned IP, named by the address, containing
//!   `containerID\nifName`
//! - `last_reserved_ip.<idx>` -- allocation hint per range-set index
//! - `cache` -- newline-delimited `start-end` lines, one per held lease block
//! - `lock` -- advisory lock file serializing every operation on the store
//!
//! The store exclusively owns everything under its directory. Callers take
//! the lock for the whole duration of an operation; concurrent plugin
//! invocations on the same node serialize on it.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IpamError, Result};
use crate::range::SimpleRange;

const LOCK_FILE: &str = "lock";
const CACHE_FILE: &str = "cache";
const CACHE_TMP_FILE: &str = ".cache.tmp";
const HINT_PREFIX: &str = "last_reserved_ip.";

/// One recorded IP assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub ip: Ipv4Addr,
    pub container_id: String,
    pub if_name: String,
}

/// Per-network on-disk store
pub struct Store {
    network: String,
    dir: PathBuf,
    lock: Option<Flock<File>>,
}

fn store_io(path: &Path, source: std::io::Error) -> IpamError {
    IpamError::StoreIo {
        path: path.to_path_buf(),
        source,
    }
}

impl Store {
    /// Open (creating if needed) the store for one network
    pub fn open(network: &str, data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(network);
        fs::create_dir_all(&dir).map_err(|e| store_io(&dir, e))?;
        Ok(Self {
            network: network.to_string(),
            dir,
            lock: None,
        })
    }

    /// Network directories present under a data dir
    pub fn networks(data_dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(store_io(data_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| store_io(data_dir, e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Take the store's exclusive advisory lock; no-op when already held
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| store_io(&path, e))?;
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| store_io(&path, std::io::Error::from_raw_os_error(errno as i32)))?;
        self.lock = Some(guard);
        Ok(())
    }

    /// Release the advisory lock
    pub fn unlock(&mut self) -> Result<()> {
        if let Some(guard) = self.lock.take() {
            let path = self.dir.join(LOCK_FILE);
            guard.unlock().map_err(|(_, errno)| {
                store_io(&path, std::io::Error::from_raw_os_error(errno as i32))
            })?;
        }
        Ok(())
    }

    fn ip_path(&self, ip: Ipv4Addr) -> PathBuf {
        self.dir.join(ip.to_string())
    }

    fn hint_path(&self, idx: usize) -> PathBuf {
        self.dir.join(format!("{}{}", HINT_PREFIX, idx))
    }

    /// Record `ip -> (container, interface)`, exclusively
    ///
    /// Returns `false` without touching anything when the address is already
    /// taken. The hint for `idx` advances only after the assignment file is
    /// durably in place.
    pub fn reserve(
        &mut self,
        container_id: &str,
        if_name: &str,
        ip: Ipv4Addr,
        idx: usize,
    ) -> Result<bool> {
        let path = self.ip_path(ip);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(store_io(&path, e)),
        };
        if let Err(e) = file.write_all(format!("{}\n{}", container_id, if_name).as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(store_io(&path, e));
        }
        let hint = self.hint_path(idx);
        fs::write(&hint, ip.to_string()).map_err(|e| store_io(&hint, e))?;
        debug!(network = %self.network, %ip, container = container_id, "reserved address");
        Ok(true)
    }

    /// The most recently reserved IP for a range-set index, if recorded
    pub fn last_reserved_ip(&self, idx: usize) -> Option<Ipv4Addr> {
        let raw = fs::read_to_string(self.hint_path(idx)).ok()?;
        raw.trim().parse().ok()
    }

    /// Read one assignment back, `None` when the address is unassigned
    pub fn read_assignment(&self, ip: Ipv4Addr) -> Result<Option<Assignment>> {
        let path = self.ip_path(ip);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_io(&path, e)),
        };
        let mut lines = raw.lines();
        let container_id = lines.next().unwrap_or("").trim().to_string();
        let if_name = lines.next().unwrap_or("").trim().to_string();
        Ok(Some(Assignment {
            ip,
            container_id,
            if_name,
        }))
    }

    /// Every assignment currently recorded for this network
    pub fn assignments(&self) -> Result<Vec<Assignment>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| store_io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| store_io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(ip) = name.parse::<Ipv4Addr>() else {
                continue;
            };
            if let Some(assignment) = self.read_assignment(ip)? {
                out.push(assignment);
            }
        }
        out.sort_by_key(|a| a.ip);
        Ok(out)
    }

    /// Whether any assignment belongs to `(container, interface)`
    pub fn has_by_id(&self, container_id: &str, if_name: &str) -> Result<bool> {
        Ok(self
            .assignments()?
            .iter()
            .any(|a| a.container_id == container_id && a.if_name == if_name))
    }

    /// Delete every assignment held by `(container, interface)`
    ///
    /// Releasing an unknown pair is a no-op, so release is idempotent.
    pub fn release_by_id(&mut self, container_id: &str, if_name: &str) -> Result<()> {
        for assignment in self.assignments()? {
            if assignment.container_id == container_id && assignment.if_name == if_name {
                self.release_by_ip(assignment.ip)?;
            }
        }
        Ok(())
    }

    /// Delete the assignment file for one address, if present
    pub fn release_by_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        let path = self.ip_path(ip);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(network = %self.network, %ip, "released address");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_io(&path, e)),
        }
    }

    /// The lease blocks recorded in the cache file
    ///
    /// Malformed lines are skipped with a warning; the reconciler restores
    /// parity with the coordinator on its next sweep.
    pub fn load_cache(&self) -> Result<Vec<SimpleRange>> {
        let path = self.dir.join(CACHE_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_io(&path, e)),
        };
        let mut blocks = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<SimpleRange>() {
                Ok(block) => blocks.push(block),
                Err(_) => warn!(network = %self.network, line, "skipping malformed cache line"),
            }
        }
        Ok(blocks)
    }

    /// Append one lease block to the cache; duplicates are rejected
    pub fn append_cache(&mut self, block: &SimpleRange) -> Result<()> {
        if self.load_cache()?.contains(block) {
            return Err(IpamError::DuplicateCacheEntry(*block));
        }
        let path = self.dir.join(CACHE_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| store_io(&path, e))?;
        file.write_all(format!("{}\n", block).as_bytes())
            .map_err(|e| store_io(&path, e))?;
        Ok(())
    }

    /// Drop one lease block from the cache, if recorded
    pub fn delete_cache(&mut self, block: &SimpleRange) -> Result<()> {
        let remaining: Vec<SimpleRange> = self
            .load_cache()?
            .into_iter()
            .filter(|b| b != block)
            .collect();
        self.flash_cache(&remaining)
    }

    /// Atomically rewrite the cache file with the given blocks
    pub fn flash_cache(&mut self, blocks: &[SimpleRange]) -> Result<()> {
        let tmp = self.dir.join(CACHE_TMP_FILE);
        let path = self.dir.join(CACHE_FILE);
        let mut contents = String::new();
        for block in blocks {
            contents.push_str(&block.to_string());
            contents.push('\n');
        }
        fs::write(&tmp, contents).map_err(|e| store_io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| store_io(&path, e))?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // dropping the flock guard releases the advisory lock
        self.lock.take();
    }
}
