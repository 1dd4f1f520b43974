//! Single-process advisory locking
//!
//! Mirrors the engine's five lock levels. Every handle open on the same file
//! shares one [`LockTable`]; there is no inter-process coordination.

use crate::error::{Result, VfsError};
use std::fmt;

/// Lock level held by a handle, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockLevel {
    #[default]
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    /// Convert from the engine's numeric lock level
    pub fn from_raw(level: i32) -> Option<Self> {
        match level {
            0 => Some(LockLevel::None),
            1 => Some(LockLevel::Shared),
            2 => Some(LockLevel::Reserved),
            3 => Some(LockLevel::Pending),
            4 => Some(LockLevel::Exclusive),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockLevel::None => "none",
            LockLevel::Shared => "shared",
            LockLevel::Reserved => "reserved",
            LockLevel::Pending => "pending",
            LockLevel::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

/// Identifies a handle within one adapter
pub type HandleId = u64;

/// Lock state of one file across all of its open handles
#[derive(Debug, Default)]
pub struct LockTable {
    /// Handles holding at least a shared lock
    shared: usize,
    /// Holder of reserved, pending or exclusive
    writer: Option<HandleId>,
    /// Writer has announced it wants exclusive; new readers are refused
    pending: bool,
    exclusive: bool,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `handle` from `current` up to `requested`
    ///
    /// Returns the level the handle actually holds afterwards. An exclusive
    /// request blocked only by other readers leaves the handle at pending,
    /// which keeps new readers out while they drain.
    pub fn acquire(
        &mut self,
        handle: HandleId,
        current: LockLevel,
        requested: LockLevel,
    ) -> std::result::Result<LockLevel, (LockLevel, VfsError)> {
        if requested <= current {
            return Ok(current);
        }

        let conflict = |held: &str| VfsError::LockConflict {
            requested: requested.to_string(),
            held: held.to_string(),
        };

        let mut level = current;

        if current == LockLevel::None {
            if self.pending || self.exclusive {
                return Err((current, conflict("pending")));
            }
            self.shared += 1;
            level = LockLevel::Shared;
        }

        if requested == LockLevel::Shared {
            return Ok(level);
        }

        match self.writer {
            Some(other) if other != handle => {
                return Err((level, conflict("reserved")));
            }
            _ => self.writer = Some(handle),
        }

        match requested {
            LockLevel::Reserved => Ok(LockLevel::Reserved),
            LockLevel::Pending => {
                self.pending = true;
                Ok(LockLevel::Pending)
            }
            LockLevel::Exclusive => {
                self.pending = true;
                if self.shared > 1 {
                    return Err((LockLevel::Pending, conflict("shared")));
                }
                self.exclusive = true;
                Ok(LockLevel::Exclusive)
            }
            LockLevel::None | LockLevel::Shared => Ok(level),
        }
    }

    /// Move `handle` from `current` down to `requested` (shared or none)
    pub fn release(&mut self, handle: HandleId, current: LockLevel, requested: LockLevel) -> LockLevel {
        if requested >= current {
            return current;
        }

        if current >= LockLevel::Reserved && self.writer == Some(handle) {
            self.writer = None;
            self.pending = false;
            self.exclusive = false;
        }

        if requested == LockLevel::None && current >= LockLevel::Shared {
            self.shared = self.shared.saturating_sub(1);
        }

        requested.min(LockLevel::Shared)
    }

    /// True if any handle holds reserved or stronger
    pub fn is_reserved(&self) -> bool {
        self.writer.is_some()
    }
}

/// Shared helper for handles: take a lock and record the resulting level
pub fn lock_to(
    table: &mut LockTable,
    handle: HandleId,
    level: &mut LockLevel,
    requested: LockLevel,
) -> Result<()> {
    match table.acquire(handle, *level, requested) {
        Ok(held) => {
            *level = held;
            Ok(())
        }
        Err((held, err)) => {
            *level = held;
            Err(err)
        }
    }
}
