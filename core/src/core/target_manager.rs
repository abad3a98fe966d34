use std::collections::HashSet;

use parking_lot::Mutex;

/// Registry of request families (structural signatures) already scanned.
///
/// The automatic path consults it so each family is tested once; manual
/// submissions bypass it.
#[derive(Debug, Default)]
pub struct TargetManager {
    seen: Mutex<HashSet<String>>,
}

impl TargetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `signature`; `true` if it had not been seen before.
    pub fn insert_if_new(&self, signature: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(signature) {
            return false;
        }
        seen.insert(signature.to_string())
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.seen.lock().contains(signature)
    }

    /// Lets a family be scanned again, e.g. after its scan errored out.
    pub fn forget(&self, signature: &str) -> bool {
        self.seen.lock().remove(signature)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}
