//! Persistent guest IP allocation.
//!
//! Allocations are keyed by VM id and stored as JSON next to the rest of the
//! backend state, so restarting the backend never hands out an address that
//! is still leased.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpPoolError {
    #[error("i/o error on the pool state file")]
    Io(#[from] std::io::Error),
    #[error("corrupt pool state file")]
    Json(#[from] serde_json::Error),
    #[error("no free addresses left in the pool")]
    PoolExhausted,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
struct PoolState {
    /// vm id -> leased address
    allocations: HashMap<String, String>,
}

/// A first-free IPv4 allocator over an inclusive address range.
#[derive(Debug)]
pub struct IpPool {
    state_path: PathBuf,
    start: u32,
    end: u32,
    // Serializes read-modify-write cycles on the state file.
    lock: Mutex<()>,
}

impl IpPool {
    pub fn new<P: AsRef<Path>>(
        state_path: P,
        start: Ipv4Addr,
        end: Ipv4Addr,
    ) -> Result<Self, IpPoolError> {
        let pool = Self {
            state_path: state_path.as_ref().to_path_buf(),
            start: u32::from(start),
            end: u32::from(end),
            lock: Mutex::new(()),
        };

        if !pool.state_path.exists() {
            pool.write_state(&PoolState::default())?;
        }

        Ok(pool)
    }

    fn read_state(&self) -> Result<PoolState, IpPoolError> {
        let contents = match fs::read_to_string(&self.state_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PoolState::default());
            }
            Err(e) => return Err(e.into()),
        };

        if contents.trim().is_empty() {
            return Ok(PoolState::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    fn write_state(&self, state: &PoolState) -> Result<(), IpPoolError> {
        let json = serde_json::to_string_pretty(state)?;
        // Write-then-rename, so a crash mid-write cannot truncate the state.
        let tmp = self.state_path.with_extension("part");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Lease an address for `vm_id`. Asking again for the same id returns
    /// the address it already holds.
    pub fn allocate(&self, vm_id: &str) -> Result<String, IpPoolError> {
        let _guard = self.lock.lock().unwrap();
        let mut state = self.read_state()?;

        if let Some(existing) = state.allocations.get(vm_id) {
            return Ok(existing.clone());
        }

        let leased: HashSet<&String> = state.allocations.values().collect();

        let mut candidate = self.start;
        let ip = loop {
            if candidate > self.end {
                return Err(IpPoolError::PoolExhausted);
            }
            let ip = Ipv4Addr::from(candidate).to_string();
            if !leased.contains(&ip) {
                break ip;
            }
            candidate += 1;
        };

        state.allocations.insert(vm_id.to_string(), ip.clone());
        self.write_state(&state)?;

        Ok(ip)
    }

    /// Return `vm_id`'s address to the pool. `Ok(false)` if it held none.
    pub fn release(&self, vm_id: &str) -> Result<bool, IpPoolError> {
        let _guard = self.lock.lock().unwrap();
        let mut state = self.read_state()?;

        if state.allocations.remove(vm_id).is_some() {
            self.write_state(&state)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_pool() -> (IpPool, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = IpPool::new(
            dir.path().join("ips.json"),
            Ipv4Addr::new(192, 168, 39, 10),
            Ipv4Addr::new(192, 168, 39, 12), // three addresses
        )
        .unwrap();
        (pool, dir)
    }

    #[test]
    fn allocate_and_release() {
        let (pool, _dir) = small_pool();

        let ip = pool.allocate("vm-1").unwrap();
        assert_eq!(ip, "192.168.39.10");

        assert!(pool.release("vm-1").unwrap());

        // The freed address is the first candidate again.
        assert_eq!(pool.allocate("vm-2").unwrap(), "192.168.39.10");
    }

    #[test]
    fn allocation_is_idempotent_per_vm() {
        let (pool, _dir) = small_pool();

        let first = pool.allocate("vm-1").unwrap();
        let second = pool.allocate("vm-1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let (pool, _dir) = small_pool();

        pool.allocate("vm-1").unwrap();
        pool.allocate("vm-2").unwrap();
        pool.allocate("vm-3").unwrap();

        assert!(matches!(
            pool.allocate("vm-4"),
            Err(IpPoolError::PoolExhausted)
        ));
    }

    #[test]
    fn releasing_an_unknown_vm_reports_false() {
        let (pool, _dir) = small_pool();
        assert!(!pool.release("vm-never-seen").unwrap());
    }

    #[test]
    fn state_survives_reopening() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ips.json");
        let start = Ipv4Addr::new(10, 0, 0, 1);
        let end = Ipv4Addr::new(10, 0, 0, 10);

        {
            let pool = IpPool::new(&path, start, end).unwrap();
            pool.allocate("vm-1").unwrap();
        }

        {
            let pool = IpPool::new(&path, start, end).unwrap();
            // vm-1 still holds 10.0.0.1, so vm-2 gets the next one.
            assert_eq!(pool.allocate("vm-1").unwrap(), "10.0.0.1");
            assert_eq!(pool.allocate("vm-2").unwrap(), "10.0.0.2");
        }
    }
}
