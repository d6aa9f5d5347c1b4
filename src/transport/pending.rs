//! The outstanding-pending-commands registry.
//!
//! The source material keys pending commands by the address of their
//! heap-allocated record and trusts the kernel to return that address
//! untouched as the correlation token. We do neither: pending commands live
//! in an owning generational slot vector, and the "token" handed to the
//! kernel is just `(index, generation)` packed into a `u64`. A token can
//! never alias a different, later command once its slot is reused, because
//! the generation is bumped on every removal -- this is what makes a
//! double-free or a stale-timeout delivery structurally impossible instead
//! of merely guarded by a flag.

use crate::{address::Address, message::Message, os::TimerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingCommandId {
  index: u32,
  generation: u32,
}

impl PendingCommandId {
  pub(crate) fn to_raw(self) -> u64 {
    (u64::from(self.index) << 32) | u64::from(self.generation)
  }

  pub(crate) fn from_raw(raw: u64) -> Self {
    PendingCommandId {
      index: (raw >> 32) as u32,
      generation: raw as u32,
    }
  }
}

pub(crate) struct PendingCommand {
  pub request: Message,
  pub target: Address,
  pub on_response: Box<dyn FnOnce(Message) + Send>,
  pub timer_id: TimerId,
}

struct Slot {
  generation: u32,
  entry: Option<PendingCommand>,
}

#[derive(Default)]
pub(crate) struct PendingTable {
  slots: Vec<Slot>,
  free: Vec<u32>,
}

impl PendingTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, cmd: PendingCommand) -> PendingCommandId {
    if let Some(index) = self.free.pop() {
      let slot = &mut self.slots[index as usize];
      debug_assert!(slot.entry.is_none());
      slot.entry = Some(cmd);
      PendingCommandId {
        index,
        generation: slot.generation,
      }
    } else {
      let index = self.slots.len() as u32;
      self.slots.push(Slot {
        generation: 0,
        entry: Some(cmd),
      });
      PendingCommandId { index, generation: 0 }
    }
  }

  /// Remove and return the entry for `id`, if it is still live. A
  /// mismatched generation or an out-of-range index returns `None`: this
  /// is the sole defense against an untrusted correlation token, since we
  /// never dereference `id`, only look it up.
  pub fn take(&mut self, id: PendingCommandId) -> Option<PendingCommand> {
    let slot = self.slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    let entry = slot.entry.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(id.index);
    Some(entry)
  }

  /// Patch the timer id into an already-inserted entry. Used by
  /// `send_command`, which must reserve the slot (to learn its id) before
  /// it can construct the timer closure that captures that same id.
  pub fn set_timer_id(&mut self, id: PendingCommandId, timer_id: TimerId) -> bool {
    let Some(slot) = self.slots.get_mut(id.index as usize) else {
      return false;
    };
    if slot.generation != id.generation {
      return false;
    }
    let Some(entry) = slot.entry.as_mut() else {
      return false;
    };
    entry.timer_id = timer_id;
    true
  }

  pub fn peek_target(&self, id: PendingCommandId) -> Option<&Address> {
    let slot = self.slots.get(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.entry.as_ref().map(|e| &e.target)
  }

  /// Every id currently live, for callers (like `close`) that must visit
  /// each pending command once. Collected eagerly so the caller is free to
  /// mutate the table (via `take`) while iterating.
  pub fn live_ids(&self) -> Vec<PendingCommandId> {
    self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(i, s)| {
        s.entry.as_ref().map(|_| PendingCommandId {
          index: i as u32,
          generation: s.generation,
        })
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.slots.iter().filter(|s| s.entry.is_some()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::NetFn;

  fn dummy_command() -> PendingCommand {
    PendingCommand {
      request: Message::request(NetFn::APP_REQUEST, 0x01, vec![]),
      target: Address::SystemInterface { channel: 0 },
      on_response: Box::new(|_| {}),
      timer_id: 0,
    }
  }

  #[test]
  fn stale_token_after_reuse_does_not_alias() {
    let mut table = PendingTable::new();
    let first = table.insert(dummy_command());
    assert!(table.take(first).is_some());
    // Slot is now free and will be reused, but at a bumped generation.
    let second = table.insert(dummy_command());
    assert_eq!(first.index, second.index, "slot should be recycled");
    assert_ne!(first.generation, second.generation);
    // The stale first token must not resolve to the new command.
    assert!(table.take(first).is_none());
    assert!(table.take(second).is_some());
  }

  #[test]
  fn double_take_is_a_no_op_the_second_time() {
    let mut table = PendingTable::new();
    let id = table.insert(dummy_command());
    assert!(table.take(id).is_some());
    assert!(table.take(id).is_none());
  }

  #[test]
  fn raw_token_round_trips() {
    let mut table = PendingTable::new();
    let id = table.insert(dummy_command());
    let raw = id.to_raw();
    assert_eq!(PendingCommandId::from_raw(raw), id);
  }
}
