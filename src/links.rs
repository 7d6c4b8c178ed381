//! Pending-link index: which block exits jump, or want to jump, to a guest address.
//!
//! When a block appears at an address, every exit registered here is linked to it. When it is destroyed, the linked
//! ones are sent back to the dispatcher. Registrations survive the target being destroyed, so a retranslation at the
//! same address gets its predecessors back.

use crate::block::BlockId;

use std::collections::HashMap;

/// An exit of a block: the block and the exit slot (0 or 1).
pub type ExitRef = (BlockId, usize);

#[derive(Debug, Default)]
pub struct PendingLinks {
    links_to: HashMap<u32, Vec<ExitRef>>,
}

impl PendingLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers that `exit` targets `address`. Registering twice has no effect.
    pub fn insert(&mut self, address: u32, exit: ExitRef) {
        let sources = self.links_to.entry(address).or_default();
        if !sources.contains(&exit) {
            sources.push(exit);
        }
    }

    pub fn remove(&mut self, address: u32, exit: ExitRef) {
        if let Some(sources) = self.links_to.get_mut(&address) {
            sources.retain(|e| *e != exit);
            if sources.is_empty() {
                self.links_to.remove(&address);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, address: u32, exit: ExitRef) -> bool {
        self.links_to.get(&address).is_some_and(|sources| sources.contains(&exit))
    }

    /// Exits targeting `address`, in registration order.
    pub fn sources(&self, address: u32) -> &[ExitRef] {
        self.links_to.get(&address).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of target addresses with at least one registered exit.
    pub fn len(&self) -> usize {
        self.links_to.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links_to.is_empty()
    }

    pub fn clear(&mut self) {
        self.links_to.clear();
    }
}
