//! Resources whose release waits on stream work.
//!
//! A freed allocation or a staged host buffer may still be read by commands already
//! enqueued. Each entry carries one fence per stream that might touch it, and is handed
//! back once every fence has completed.

use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct Deferred<F, T> {
    entries: VecDeque<(Vec<F>, T)>,
}

impl<F, T> Default for Deferred<F, T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<F, T> Deferred<F, T> {
    pub(crate) fn push(&mut self, fences: Vec<F>, item: T) {
        self.entries.push_back((fences, item));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn items(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }

    /// Removes every entry whose fences have all completed and returns them, fences
    /// included so the caller can recycle them.
    pub(crate) fn reap(&mut self, mut complete: impl FnMut(&F) -> bool) -> Vec<(Vec<F>, T)> {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(fences, _)| fences.iter().all(&mut complete));
        self.entries = waiting;
        ready.into()
    }

    /// Empties the set regardless of fence state.
    #[cfg_attr(not(feature = "acl"), allow(dead_code))]
    pub(crate) fn take_all(&mut self) -> Vec<(Vec<F>, T)> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_entry_released_once_every_fence_completes() {
        let mut deferred: Deferred<u32, &str> = Default::default();
        deferred.push(vec![1, 2], "a");
        deferred.push(vec![2], "b");
        deferred.push(Vec::new(), "c");

        let mut complete = HashSet::from([2]);
        let ready = deferred.reap(|f| complete.contains(f));
        let names: Vec<&str> = ready.iter().map(|(_, item)| *item).collect();
        assert_eq!(names, ["b", "c"]);
        assert_eq!(deferred.len(), 1);

        complete.insert(1);
        let ready = deferred.reap(|f| complete.contains(f));
        assert_eq!(ready, [(vec![1, 2], "a")]);
        assert_eq!(deferred.len(), 0);
    }

    #[test]
    fn test_pending_entries_stay_in_order() {
        let mut deferred: Deferred<u32, usize> = Default::default();
        for i in 0..5 {
            deferred.push(vec![i as u32], i);
        }
        let ready = deferred.reap(|f| f % 2 == 0);
        assert_eq!(ready.into_iter().map(|(_, i)| i).collect::<Vec<_>>(), [0, 2, 4]);
        assert_eq!(deferred.items().copied().collect::<Vec<_>>(), [1, 3]);

        assert_eq!(deferred.take_all().len(), 2);
        assert_eq!(deferred.len(), 0);
        assert!(deferred.reap(|_| true).is_empty());
    }
}
