//! # Typed Pools
//!
//! Derived indices (procedure tables, type graphs) are stored in pools and
//! addressed by small integer ids instead of references. That keeps
//! self-referential structures, such as a struct containing a pointer to
//! itself, expressible without owned recursive trees.
//!
//! Pools follow a stack discipline: [`Pool::begin_frame`] records the current
//! top and [`Pool::end_frame`] rolls back to it, which is how scratch records
//! are discarded after a failed partial build. Capacity is bounded; the first
//! allocation past the limit sets a sticky exhausted flag that the owner
//! checks instead of unwinding.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{Result, SymError};

/// Default number of records a pool may hold.
pub const DEFAULT_POOL_LIMIT: usize = 1 << 20;

/// Index of a record inside a [`Pool`]
pub struct Id<T>
{
    index: u32,
    marker: PhantomData<fn() -> T>,
}

impl<T> Id<T>
{
    /// Raw slot index.
    pub const fn index(self) -> usize
    {
        self.index as usize
    }

    pub(crate) const fn from_index(index: u32) -> Self
    {
        Self {
            index,
            marker: PhantomData,
        }
    }
}

// Manual impls: derives would require `T: Clone` etc.
impl<T> Clone for Id<T>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T>
{
    fn eq(&self, other: &Self) -> bool
    {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T>
{
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering>
    {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T>
{
    fn cmp(&self, other: &Self) -> std::cmp::Ordering
    {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T>
{
    fn hash<H: std::hash::Hasher>(&self, state: &mut H)
    {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.index)
    }
}

/// Saved pool top, returned by [`Pool::begin_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMark(usize);

/// Append-only typed pool with stack-discipline rollback
#[derive(Debug, Clone)]
pub struct Pool<T>
{
    items: Vec<T>,
    limit: usize,
    exhausted: bool,
}

impl<T> Default for Pool<T>
{
    fn default() -> Self
    {
        Self::with_limit(DEFAULT_POOL_LIMIT)
    }
}

impl<T> Pool<T>
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Create a pool that holds at most `limit` records.
    pub fn with_limit(limit: usize) -> Self
    {
        Self {
            items: Vec::new(),
            limit: limit.min(u32::MAX as usize),
            exhausted: false,
        }
    }

    /// Append a record.
    ///
    /// ## Errors
    ///
    /// Returns [`SymError::ResourceExhausted`] once the limit is reached. The
    /// failure is sticky: later pushes fail too, even after a rollback.
    pub fn push(&mut self, item: T) -> Result<Id<T>>
    {
        if self.exhausted || self.items.len() >= self.limit {
            self.exhausted = true;
            return Err(SymError::ResourceExhausted(format!("pool limit of {} records", self.limit)));
        }
        let id = Id::from_index(self.items.len() as u32);
        self.items.push(item);
        Ok(id)
    }

    pub fn get(&self, id: Id<T>) -> Option<&T>
    {
        self.items.get(id.index())
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T>
    {
        self.items.get_mut(id.index())
    }

    pub fn len(&self) -> usize
    {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.items.is_empty()
    }

    /// Whether an allocation has ever failed.
    pub fn is_exhausted(&self) -> bool
    {
        self.exhausted
    }

    /// Record the current top so it can be restored with [`Pool::end_frame`].
    pub fn begin_frame(&self) -> FrameMark
    {
        FrameMark(self.items.len())
    }

    /// Discard everything pushed since `mark`.
    pub fn end_frame(&mut self, mark: FrameMark)
    {
        self.items.truncate(mark.0);
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (Id<T>, &T)> + '_
    {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| (Id::from_index(index as u32), item))
    }

    pub fn as_slice(&self) -> &[T]
    {
        &self.items
    }
}
