//! Per-message table of attachments keyed by checksum.
//!
//! Inserting an attachment whose checksum is already present returns the
//! stored instance instead of adding a second copy. Positions are assigned
//! lazily: the first time the store is asked for its wire order while any
//! entry is still unpositioned, every entry is numbered 1..N in insertion
//! order.

use std::collections::HashMap;

use super::attachment::Attachment;

/// Deduplicating attachment collection owned by one [`Message`](super::Message).
#[derive(Debug, Clone, Default)]
pub struct AttachmentStore {
    /// Attachments in insertion order.
    entries: Vec<Attachment>,
    /// Checksum to index into `entries`.
    index: HashMap<String, usize>,
}

impl AttachmentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an attachment, returning the stored instance for its checksum.
    ///
    /// The second insertion of an equal checksum keeps the first entry.
    pub fn insert(&mut self, attachment: Attachment) -> &Attachment {
        let idx = match self.index.get(attachment.checksum()) {
            Some(&idx) => idx,
            None => {
                let idx = self.entries.len();
                self.index.insert(attachment.checksum().to_string(), idx);
                self.entries.push(attachment);
                idx
            }
        };
        &self.entries[idx]
    }

    /// Look up an attachment by checksum.
    pub fn get(&self, checksum: &str) -> Option<&Attachment> {
        self.index.get(checksum).map(|&idx| &self.entries[idx])
    }

    /// Position assigned to the attachment with this checksum, if stored.
    pub fn position(&self, checksum: &str) -> Option<u32> {
        self.get(checksum).map(Attachment::position)
    }

    /// Number of distinct attachments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no attachments are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all attachment lengths.
    pub fn total_length(&self) -> u64 {
        self.entries.iter().map(Attachment::len).sum()
    }

    /// Number every entry 1..N unless the positions already are exactly 1..N.
    ///
    /// A decoded message can hold positions with gaps when its header did not
    /// reference every trailer entry; those are renumbered too.
    /// Returns true if positions were (re)assigned by this call.
    pub fn assign_positions(&mut self) -> bool {
        let mut positions: Vec<u32> = self.entries.iter().map(Attachment::position).collect();
        positions.sort_unstable();
        if positions.iter().zip(1u32..).all(|(&p, expected)| p == expected) {
            return false;
        }
        for (i, attachment) in self.entries.iter_mut().enumerate() {
            attachment.set_position(i as u32 + 1);
        }
        true
    }

    /// Attachments sorted by position (wire order).
    ///
    /// Call [`assign_positions`](Self::assign_positions) first when encoding.
    pub fn ordered(&self) -> Vec<&Attachment> {
        let mut ordered: Vec<&Attachment> = self.entries.iter().collect();
        ordered.sort_by_key(|a| a.position());
        ordered
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_deduplicates_by_checksum() {
        let mut store = AttachmentStore::new();
        store.insert(Attachment::from_bytes("txt", &b"same"[..]).with_name("first"));
        let kept = store.insert(Attachment::from_bytes("bin", &b"same"[..]).with_name("second"));

        assert_eq!(kept.name(), Some("first"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_positions_assigned_once_in_insertion_order() {
        let mut store = AttachmentStore::new();
        let a = Attachment::from_bytes("a", &b"aaa"[..]);
        let b = Attachment::from_bytes("b", &b"bb"[..]);
        let (ca, cb) = (a.checksum().to_string(), b.checksum().to_string());
        store.insert(a);
        store.insert(b);

        assert_eq!(store.position(&ca), Some(0));
        assert!(store.assign_positions());
        assert!(!store.assign_positions());
        assert_eq!(store.position(&ca), Some(1));
        assert_eq!(store.position(&cb), Some(2));

        let ordered: Vec<&str> = store.ordered().iter().map(|a| a.format()).collect();
        assert_eq!(ordered, vec!["a", "b"]);
        assert_eq!(store.total_length(), 5);
    }

    #[test]
    fn test_late_insert_renumbers_all() {
        let mut store = AttachmentStore::new();
        store.insert(Attachment::from_bytes("a", &b"1"[..]));
        store.assign_positions();
        store.insert(Attachment::from_bytes("b", &b"2"[..]));

        assert!(store.assign_positions());
        let positions: Vec<u32> = store.iter().map(Attachment::position).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn test_gapped_positions_are_renumbered() {
        let mut store = AttachmentStore::new();
        let mut a = Attachment::from_bytes("a", &b"1"[..]);
        a.set_position(2);
        let mut b = Attachment::from_bytes("b", &b"2"[..]);
        b.set_position(1);
        store.insert(a);
        store.insert(b);
        assert!(!store.assign_positions(), "a permutation of 1..N is kept");

        let mut store = AttachmentStore::new();
        let mut only = Attachment::from_bytes("c", &b"3"[..]);
        only.set_position(2);
        let checksum = only.checksum().to_string();
        store.insert(only);

        assert!(store.assign_positions());
        assert_eq!(store.position(&checksum), Some(1));
    }

    #[test]
    fn test_empty_store() {
        let mut store = AttachmentStore::new();
        assert!(store.is_empty());
        assert!(!store.assign_positions());
        assert!(store.ordered().is_empty());
        assert!(store.get("00").is_none());
    }
}
