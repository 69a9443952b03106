use uuid::Uuid;

/// Ordered set of pinned message ids for one conversation.
///
/// Pin is idempotent; unpinning an absent id is a no-op, so duplicate
/// pin-changed deliveries converge.
#[derive(Debug, Default)]
pub struct PinnedSet {
    ids: Vec<Uuid>,
}

impl PinnedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&mut self, id: Uuid) {
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    pub fn unpin(&mut self, id: Uuid) {
        self.ids.retain(|p| *p != id);
    }

    /// Replace local state with a fetched snapshot.
    pub fn replace(&mut self, ids: Vec<Uuid>) {
        self.ids = ids;
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_is_idempotent_and_keeps_order() {
        let mut pins = PinnedSet::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        pins.pin(a);
        pins.pin(b);
        pins.pin(a);

        assert_eq!(pins.ids(), &[a, b]);
    }

    #[test]
    fn unpin_absent_id_is_noop() {
        let mut pins = PinnedSet::new();
        let a = Uuid::new_v4();

        pins.unpin(a);
        assert!(pins.ids().is_empty());

        pins.pin(a);
        pins.unpin(a);
        pins.unpin(a);
        assert!(!pins.contains(a));
    }
}
