// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-Tolerant Lock Helpers
//!
//! The per-key security tables live in `DashMap`s; the remaining shared
//! state (the manual clock, the in-memory ports, the audit file chain head,
//! the kernel's background handles) sits behind `std::sync` locks. A panic
//! while one of those is held would normally poison it and turn every later
//! access into a panic of its own. The security kernel must keep answering,
//! so these helpers recover the guard and log the event instead.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use gatekeeper::security::locks::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(0u32);
//! *resilient_write(&lock) += 1;
//! assert_eq!(*resilient_read(&lock), 1);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering guard."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering guard."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned; recovering guard"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_write_then_read() {
        let lock = RwLock::new(HashMap::new());
        resilient_write(&lock).insert("1.2.3.4", 3u32);
        assert_eq!(resilient_read(&lock).get("1.2.3.4"), Some(&3));
    }

    #[test]
    fn test_poisoned_lock_still_serves_reads_and_writes() {
        let lock = Arc::new(RwLock::new(HashMap::from([("alice", 1u32)])));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();
        assert!(lock.is_poisoned());

        assert_eq!(resilient_read(&lock).get("alice"), Some(&1));
        resilient_write(&lock).insert("alice", 2);
        assert_eq!(resilient_read(&lock).get("alice"), Some(&2));
    }

    #[test]
    fn test_poisoned_mutex_is_recovered() {
        let lock = Arc::new(Mutex::new(Some(7u32)));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();
        assert!(lock.is_poisoned());

        assert_eq!(resilient_lock(&lock).take(), Some(7));
        assert_eq!(*resilient_lock(&lock), None);
    }
}
