use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Process-wide id of a shares-weighted I/O admission bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoPriorityClass(pub(crate) u32);

impl IoPriorityClass {
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: IoPriorityClass,
    pub name: String,
    pub shares: u32,
}

struct Registry {
    classes: Vec<ClassInfo>,
    snapshot: Arc<Vec<ClassInfo>>,
}

impl Registry {
    fn refresh_snapshot(&mut self) {
        self.snapshot = Arc::new(self.classes.clone());
        GENERATION.fetch_add(1, Ordering::Release);
    }
}

// The lock is short-held: registration and rename only. Shards read
// through a copy-on-write snapshot they refresh when the generation moves,
// so the data path never touches the mutex.
static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);
static GENERATION: AtomicU64 = AtomicU64::new(1);

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(|| Registry {
        classes: Vec::new(),
        snapshot: Arc::new(Vec::new()),
    });
    f(registry)
}

/// Registers a new priority class and returns its id.
pub fn register_priority_class(name: impl Into<String>, shares: u32) -> IoPriorityClass {
    with_registry(|r| {
        let id = IoPriorityClass(r.classes.len() as u32);
        r.classes.push(ClassInfo {
            id,
            name: name.into(),
            shares: shares.max(1),
        });
        r.refresh_snapshot();
        id
    })
}

/// Renames `pc`. Idempotent: renaming to the current name is a no-op, so
/// shards never see a spurious snapshot generation.
///
/// Returns true if the name actually changed; the caller is responsible
/// for propagating the new snapshot to every shard.
pub fn rename_priority_class(pc: IoPriorityClass, new_name: impl Into<String>) -> bool {
    let new_name = new_name.into();
    with_registry(|r| {
        let info = r
            .classes
            .get_mut(pc.0 as usize)
            .unwrap_or_else(|| panic!("unknown priority class {}", pc.0));
        if info.name == new_name {
            return false;
        }
        info.name = new_name;
        r.refresh_snapshot();
        true
    })
}

pub fn class_shares(pc: IoPriorityClass) -> u32 {
    snapshot()
        .get(pc.0 as usize)
        .map(|c| c.shares)
        .unwrap_or(1)
}

pub fn class_name(pc: IoPriorityClass) -> Option<String> {
    snapshot().get(pc.0 as usize).map(|c| c.name.clone())
}

/// Current registry snapshot; cheap to clone, safe to cache against
/// [`generation`].
pub fn snapshot() -> Arc<Vec<ClassInfo>> {
    with_registry(|r| r.snapshot.clone())
}

pub fn generation() -> u64 {
    GENERATION.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_sequential_ids_and_clamps_shares() {
        let a = register_priority_class("reg-test-a", 100);
        let b = register_priority_class("reg-test-b", 0);
        // Tests in other modules may register concurrently; ids are only
        // guaranteed unique and increasing.
        assert!(b.id() > a.id());
        assert_eq!(class_shares(b), 1);
        assert_eq!(class_name(a).unwrap(), "reg-test-a");
    }

    #[test]
    fn rename_is_idempotent() {
        let pc = register_priority_class("rename-orig", 10);
        assert!(rename_priority_class(pc, "rename-new"));
        // Same name again: observably equivalent to renaming once.
        assert!(!rename_priority_class(pc, "rename-new"));
        assert_eq!(class_name(pc).unwrap(), "rename-new");
    }

    #[test]
    fn snapshot_is_copy_on_write() {
        let pc = register_priority_class("cow", 10);
        let old = snapshot();
        let old_name = old[pc.0 as usize].name.clone();
        rename_priority_class(pc, "cow-renamed");
        // The old snapshot is untouched; readers holding it see old data.
        assert_eq!(old[pc.0 as usize].name, old_name);
        assert_eq!(snapshot()[pc.0 as usize].name, "cow-renamed");
    }
}
