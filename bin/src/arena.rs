//! Handle arena: values addressed by small integer handles.
//!
//! Handles start at `1` (`0` is the null handle) and the smallest freed handle is
//! always handed out first. A handle only resolves while its slot is occupied, so
//! stale handles report "not found" instead of aliasing a different value.

use std::{collections::BTreeSet, marker::PhantomData};

/// Default upper bound for handle values.
pub const DEFAULT_MAX_HANDLE: u32 = 0x7FFF_FFFF;

/// A typed handle into a [`HandleArena`].
pub trait ArenaHandle: Copy + Eq + std::fmt::Debug {
    /// Wraps a raw handle value.
    fn from_raw(raw: u32) -> Self;

    /// Raw handle value, `0` for null.
    fn raw(self) -> u32;
}

/// Declares a handle newtype.
macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            derive_more::Display, derive_more::From, serde::Serialize,
        )]
        #[display("{_0}")]
        pub struct $name(u32);

        impl $name {
            /// The null handle.
            pub const NULL: Self = Self(0);

            /// Whether this is the null handle.
            #[must_use]
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl ArenaHandle for $name {
            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Handle of a client instance (a request engine).
    ClientId
);
handle_type!(
    /// Handle of a set of request options.
    OptionsId
);
handle_type!(
    /// Handle of a request.
    RequestId
);

/// Arena failures.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// Every handle up to the maximum is in use.
    #[error("Handle space exhausted, maximum handle is {0}.")]
    Exhausted(u32),
}

/// Dense slot storage with a free list of handles.
#[derive(Debug)]
pub struct HandleArena<H, V> {
    /// Slot `i` holds the value of handle `i + 1`.
    slots: Vec<Option<V>>,
    /// Released handles, smallest first.
    free: BTreeSet<u32>,
    /// Number of occupied slots.
    len: usize,
    /// Largest handle that may be handed out.
    max_handle: u32,
    /// Handle type phantom.
    _phantom: PhantomData<H>,
}

impl<H: ArenaHandle, V> Default for HandleArena<H, V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDLE)
    }
}

impl<H: ArenaHandle, V> HandleArena<H, V> {
    /// Creates an empty arena whose handles never exceed `max_handle`.
    #[must_use]
    pub fn new(max_handle: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            len: 0,
            max_handle,
            _phantom: PhantomData,
        }
    }

    /// Stores `value` and returns its handle.
    ///
    /// # Errors
    /// - `ArenaError::Exhausted`
    pub fn insert(&mut self, value: V) -> Result<H, ArenaError> {
        self.insert_with(|_| value)
    }

    /// Stores the value built from the handle it is about to receive.
    ///
    /// # Errors
    /// - `ArenaError::Exhausted`
    pub fn insert_with(&mut self, make: impl FnOnce(H) -> V) -> Result<H, ArenaError> {
        let raw = self.next_free()?;
        let handle = H::from_raw(raw);
        let value = make(handle);

        let index = Self::index(raw);
        if index == self.slots.len() {
            self.slots.push(Some(value));
        } else if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(value);
        }
        self.free.remove(&raw);
        self.len = self.len.saturating_add(1);

        Ok(handle)
    }

    /// Looks a handle up.
    #[must_use]
    pub fn get(&self, handle: H) -> Option<&V> {
        if handle.raw() == 0 {
            return None;
        }
        self.slots.get(Self::index(handle.raw()))?.as_ref()
    }

    /// Looks a handle up for mutation.
    pub fn get_mut(&mut self, handle: H) -> Option<&mut V> {
        if handle.raw() == 0 {
            return None;
        }
        self.slots.get_mut(Self::index(handle.raw()))?.as_mut()
    }

    /// Whether the handle resolves to a value.
    #[must_use]
    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Removes the value and releases its handle for reuse.
    pub fn remove(&mut self, handle: H) -> Option<V> {
        if handle.raw() == 0 {
            return None;
        }
        let value = self.slots.get_mut(Self::index(handle.raw()))?.take()?;
        self.free.insert(handle.raw());
        self.len = self.len.saturating_sub(1);
        Some(value)
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates occupied slots in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &V)> {
        self.slots
            .iter()
            .zip(1..)
            .filter_map(|(slot, raw)| slot.as_ref().map(|value| (H::from_raw(raw), value)))
    }

    /// Iterates occupied slots in handle order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (H, &mut V)> {
        self.slots
            .iter_mut()
            .zip(1..)
            .filter_map(|(slot, raw)| slot.as_mut().map(|value| (H::from_raw(raw), value)))
    }

    /// Snapshot of the live handles, so the arena can be mutated while walking them.
    #[must_use]
    pub fn handles(&self) -> Vec<H> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Picks the handle the next insertion receives.
    fn next_free(&self) -> Result<u32, ArenaError> {
        if let Some(raw) = self.free.first() {
            return Ok(*raw);
        }
        // With an empty free list every slot is occupied, so the slot past the end is
        // the only vacant one.
        u32::try_from(self.slots.len())
            .ok()
            .and_then(|used| used.checked_add(1))
            .filter(|raw| *raw <= self.max_handle)
            .ok_or(ArenaError::Exhausted(self.max_handle))
    }

    /// Slot index of a non-null raw handle.
    fn index(raw: u32) -> usize {
        usize::try_from(raw.saturating_sub(1)).unwrap_or(usize::MAX)
    }
}
