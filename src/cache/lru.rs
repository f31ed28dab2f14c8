//! Recency bookkeeping for the page cache's eviction policy.
//!
//! Grounded on the teacher's intrusive doubly-linked `LruCache`
//! (`buffer/lru.rs`), simplified to a monotonic clock counter per page
//! (`Page::touch`/`Page::age`) plus a scan for the minimum among unpinned,
//! non-dirty pages, since eviction here must additionally respect the
//! dirty-before-clean write-back ordering described in SPEC_FULL.md §4.2.

use std::collections::HashMap;

use crate::types::PageAddress;

/// Tracks last-touched order for every resident page address.
#[derive(Default)]
pub struct RecencyClock {
    tick: u64,
    last_touch: HashMap<PageAddress, u64>,
}

impl RecencyClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&mut self, addr: PageAddress) -> u64 {
        self.tick += 1;
        self.last_touch.insert(addr, self.tick);
        self.tick
    }

    pub fn remove(&mut self, addr: PageAddress) {
        self.last_touch.remove(&addr);
    }

    pub fn age_of(&self, addr: PageAddress) -> u64 {
        self.last_touch.get(&addr).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_increases_age() {
        let mut clock = RecencyClock::new();
        let a = PageAddress::new(4096);
        let b = PageAddress::new(8192);
        clock.touch(a);
        clock.touch(b);
        clock.touch(a);
        assert!(clock.age_of(a) > clock.age_of(b));
    }
}
