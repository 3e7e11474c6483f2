use crate::mock::{Mock, MockKind, OrderKey};

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockUsage {
    Updated,
    Deleted,
}

/// What the replay engine did with a mock, kept until drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumedState {
    pub usage: MockUsage,
    pub is_filtered: bool,
    pub sort_order: i64,
}

#[derive(Default)]
struct Views {
    filtered_all: BTreeMap<OrderKey, Mock>,
    unfiltered_all: BTreeMap<OrderKey, Mock>,
    filtered_by_kind: HashMap<MockKind, BTreeMap<OrderKey, Mock>>,
    unfiltered_by_kind: HashMap<MockKind, BTreeMap<OrderKey, Mock>>,
    consumed: HashMap<String, ConsumedState>,
    rev_global: u64,
    rev_by_kind: HashMap<MockKind, u64>,
}

impl Views {
    fn bump(&mut self, kinds: impl IntoIterator<Item = MockKind>) {
        let mut changed = false;
        for kind in kinds {
            *self.rev_by_kind.entry(kind).or_insert(0) += 1;
            changed = true;
        }
        if changed {
            self.rev_global += 1;
        }
    }
}

/// Ordered, kind-indexed container of captured interactions.
///
/// `filtered` mocks apply to the current test; `unfiltered` mocks are
/// cross-test fallbacks. Both views are keyed by `(sort_order, id)`,
/// the total order every reader observes. Readers take snapshots;
/// writers serialize on the write lock, and no I/O ever happens under
/// it.
pub struct MockStore {
    inner: RwLock<Views>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn rebuild(
    mut mocks: Vec<Mock>,
    is_filtered: bool,
) -> (BTreeMap<OrderKey, Mock>, HashMap<MockKind, BTreeMap<OrderKey, Mock>>) {
    let mut all = BTreeMap::new();
    let mut by_kind: HashMap<MockKind, BTreeMap<OrderKey, Mock>> = HashMap::new();
    for (idx, mock) in mocks.iter_mut().enumerate() {
        // A zero sort order was never assigned by the loader; fall back
        // to the 1-based insertion index.
        if mock.test_mode_info.sort_order == 0 {
            mock.test_mode_info.sort_order = idx as i64 + 1;
        }
        mock.test_mode_info.is_filtered = is_filtered;
    }
    for mock in mocks {
        let key = mock.order_key();
        by_kind
            .entry(mock.kind)
            .or_default()
            .insert(key, mock.clone());
        all.insert(key, mock);
    }
    (all, by_kind)
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Views::default()),
        }
    }

    /// Replace the filtered view, global and per-kind, atomically.
    pub fn set_filtered(&self, mocks: Vec<Mock>) {
        let (all, by_kind) = rebuild(mocks, true);
        let mut views = self.inner.write();
        let touched: Vec<MockKind> = views
            .filtered_by_kind
            .keys()
            .chain(by_kind.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        views.filtered_all = all;
        views.filtered_by_kind = by_kind;
        views.bump(touched);
    }

    pub fn set_unfiltered(&self, mocks: Vec<Mock>) {
        let (all, by_kind) = rebuild(mocks, false);
        let mut views = self.inner.write();
        let touched: Vec<MockKind> = views
            .unfiltered_by_kind
            .keys()
            .chain(by_kind.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        views.unfiltered_all = all;
        views.unfiltered_by_kind = by_kind;
        views.bump(touched);
    }

    pub fn get_filtered(&self) -> Vec<Mock> {
        self.inner.read().filtered_all.values().cloned().collect()
    }

    pub fn get_unfiltered(&self) -> Vec<Mock> {
        self.inner.read().unfiltered_all.values().cloned().collect()
    }

    pub fn get_filtered_by_kind(&self, kind: MockKind) -> Vec<Mock> {
        self.inner
            .read()
            .filtered_by_kind
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_unfiltered_by_kind(&self, kind: MockKind) -> Vec<Mock> {
        self.inner
            .read()
            .unfiltered_by_kind
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rekey `old` to `new` in the global and per-kind unfiltered
    /// views. A kind view missing the old key self-heals by inserting
    /// the new mock anyway.
    pub fn update_unfiltered(&self, old: &Mock, new: Mock) {
        let mut views = self.inner.write();
        let kind = new.kind;
        views.unfiltered_all.remove(&old.order_key());
        views.unfiltered_all.insert(new.order_key(), new.clone());
        let kind_view = views.unfiltered_by_kind.entry(kind).or_default();
        kind_view.remove(&old.order_key());
        kind_view.insert(new.order_key(), new);
        views.bump([kind]);
    }

    /// Best-effort delete across global and per-kind filtered views.
    /// Returns whether the global view changed; a second identical call
    /// is a no-op returning false.
    pub fn delete_filtered(&self, mock: &Mock) -> bool {
        let mut views = self.inner.write();
        let removed = views.filtered_all.remove(&mock.order_key()).is_some();
        if let Some(kind_view) = views.filtered_by_kind.get_mut(&mock.kind) {
            kind_view.remove(&mock.order_key());
        }
        if removed {
            views.bump([mock.kind]);
        }
        removed
    }

    pub fn delete_unfiltered(&self, mock: &Mock) -> bool {
        let mut views = self.inner.write();
        let removed = views.unfiltered_all.remove(&mock.order_key()).is_some();
        if let Some(kind_view) = views.unfiltered_by_kind.get_mut(&mock.kind) {
            kind_view.remove(&mock.order_key());
        }
        if removed {
            views.bump([mock.kind]);
        }
        removed
    }

    pub fn flag_consumed(&self, name: &str, state: ConsumedState) {
        self.inner.write().consumed.insert(name.to_string(), state);
    }

    /// Take the consumed ledger, sorted by the numeric suffix after the
    /// first `-` in the name when both sides have one, lexicographic
    /// otherwise.
    pub fn drain_consumed(&self) -> Vec<(String, ConsumedState)> {
        let mut entries: Vec<(String, ConsumedState)> =
            self.inner.write().consumed.drain().collect();
        entries.sort_by(|(a, _), (b, _)| {
            match (numeric_suffix(a), numeric_suffix(b)) {
                (Some(na), Some(nb)) => na.cmp(&nb),
                _ => a.cmp(b),
            }
        });
        entries
    }

    pub fn rev_global(&self) -> u64 {
        self.inner.read().rev_global
    }

    pub fn rev_by_kind(&self, kind: MockKind) -> u64 {
        self.inner
            .read()
            .rev_by_kind
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

fn numeric_suffix(name: &str) -> Option<u64> {
    name.split_once('-')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MessageLog, MockSpec, TestModeInfo};

    fn mk(name: &str, id: i64, sort_order: i64, spec: MockSpec) -> Mock {
        let mut m = Mock::captured("conn-test", spec);
        m.name = name.to_string();
        m.test_mode_info = TestModeInfo {
            id,
            sort_order,
            is_filtered: false,
        };
        m
    }

    fn generic(name: &str, id: i64, sort_order: i64) -> Mock {
        mk(name, id, sort_order, MockSpec::Generic(MessageLog::default()))
    }

    #[test]
    fn zero_sort_order_gets_insertion_index() {
        let store = MockStore::new();
        store.set_filtered(vec![
            generic("mock-1", 1, 0),
            generic("mock-2", 2, 0),
            generic("mock-3", 3, 7),
        ]);
        let loaded = store.get_filtered();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].test_mode_info.sort_order, 1);
        assert_eq!(loaded[1].test_mode_info.sort_order, 2);
        assert_eq!(loaded[2].test_mode_info.sort_order, 7);
    }

    #[test]
    fn total_order_is_sort_order_then_id() {
        let store = MockStore::new();
        store.set_filtered(vec![
            generic("mock-9", 9, 5),
            generic("mock-1", 1, 5),
            generic("mock-4", 4, 2),
        ]);
        let names: Vec<String> = store.get_filtered().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["mock-4", "mock-1", "mock-9"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MockStore::new();
        let m = generic("mock-1", 1, 1);
        store.set_filtered(vec![m.clone()]);
        let mut reloaded = m.clone();
        reloaded.test_mode_info.is_filtered = true;
        assert!(store.delete_filtered(&reloaded));
        let rev = store.rev_by_kind(MockKind::Generic);
        assert!(!store.delete_filtered(&reloaded));
        // no structural change, no revision bump
        assert_eq!(store.rev_by_kind(MockKind::Generic), rev);
        assert!(store.get_filtered().is_empty());
    }

    #[test]
    fn revision_bumps_only_on_change() {
        let store = MockStore::new();
        for kind in MockKind::ALL {
            assert_eq!(store.rev_by_kind(kind), 0);
        }
        store.set_filtered(vec![mk(
            "mock-1",
            1,
            1,
            MockSpec::MySql(MessageLog::default()),
        )]);
        assert_eq!(store.rev_by_kind(MockKind::MySql), 1);
        for kind in MockKind::ALL {
            if kind != MockKind::MySql {
                assert_eq!(store.rev_by_kind(kind), 0);
            }
        }
        assert_eq!(store.rev_global(), 1);
    }

    #[test]
    fn update_unfiltered_self_heals_kind_view() {
        let store = MockStore::new();
        let old = generic("mock-1", 1, 1);
        // global view only; kind view intentionally left without the key
        store.set_unfiltered(vec![old.clone()]);
        store.delete_unfiltered(&old);
        let newer = generic("mock-1", 1, 9);
        store.update_unfiltered(&old, newer.clone());
        assert_eq!(store.get_unfiltered_by_kind(MockKind::Generic).len(), 1);
        assert_eq!(store.get_unfiltered()[0].test_mode_info.sort_order, 9);
    }

    #[test]
    fn drain_consumed_prefers_numeric_suffix() {
        let store = MockStore::new();
        let state = ConsumedState {
            usage: MockUsage::Updated,
            is_filtered: true,
            sort_order: 1,
        };
        store.flag_consumed("mock-10", state);
        store.flag_consumed("mock-2", state);
        store.flag_consumed("zmock", state);
        let drained: Vec<String> = store
            .drain_consumed()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        // numeric pairs sort numerically; the non-numeric name falls
        // back to lexicographic comparison against its neighbor
        assert_eq!(drained[0], "mock-2");
        assert_eq!(drained[1], "mock-10");
        assert!(store.drain_consumed().is_empty());
    }
}
