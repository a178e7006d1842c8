//! Poison-tolerant lock acquisition.
//!
//! Poisoned guards are recovered and the event is logged once per acquire.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    poisoned: PoisonError<G>,
    component: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        component,
        op,
        lock_kind,
        outcome = "poison_recovered",
        "cache lock was poisoned by a panicking holder; continuing with last written state"
    );
    poisoned.into_inner()
}

pub(crate) fn read<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, component, op, "rwlock.read"))
}

pub(crate) fn write<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, component, op, "rwlock.write"))
}

pub(crate) fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| recover(poisoned, component, op, "mutex"))
}
