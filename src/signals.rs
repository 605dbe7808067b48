//! Minimal observer pattern.
//!
//! A type declares a fixed set of event kinds (an enum implementing
//! [`EventKind`]) and owns an [`EventHub`] for them. Callers register
//! callbacks per kind; firing a kind runs every callback registered for it,
//! in order, on the calling thread.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// The closed set of events an object can fire.
pub trait EventKind: Copy + Eq + Hash + Debug + 'static {
    /// Every kind this object declares.
    const ALL: &'static [Self];

    /// Name used in log lines.
    fn name(self) -> &'static str;
}

/// Callback invoked with the firing object's context and the event arguments.
pub type Callback<C, A> = Box<dyn FnMut(&mut C, &A) -> anyhow::Result<()> + Send>;

pub struct EventHub<K, C, A: ?Sized> {
    handlers: HashMap<K, Vec<Callback<C, A>>>,
}

impl<K: EventKind, C, A: ?Sized> EventHub<K, C, A> {
    pub fn new() -> Self {
        Self {
            handlers: K::ALL.iter().map(|kind| (*kind, Vec::new())).collect(),
        }
    }

    /// Register `callback` to run after those already registered for `kind`.
    pub fn on<F>(&mut self, kind: K, callback: F)
    where
        F: FnMut(&mut C, &A) -> anyhow::Result<()> + Send + 'static,
    {
        self.slot(kind).push(Box::new(callback));
    }

    /// Register `callback` to run before every callback already registered for `kind`.
    pub fn prepend<F>(&mut self, kind: K, callback: F)
    where
        F: FnMut(&mut C, &A) -> anyhow::Result<()> + Send + 'static,
    {
        self.slot(kind).insert(0, Box::new(callback));
    }

    /// Run the callbacks for `kind`. The first failing callback stops the
    /// fan-out and its error is returned.
    pub fn fire(&mut self, kind: K, ctx: &mut C, args: &A) -> anyhow::Result<()> {
        if let Some(callbacks) = self.handlers.get_mut(&kind) {
            for callback in callbacks.iter_mut() {
                callback(ctx, args)?;
            }
        }
        Ok(())
    }

    fn slot(&mut self, kind: K) -> &mut Vec<Callback<C, A>> {
        self.handlers.entry(kind).or_default()
    }
}

impl<K: EventKind, C, A: ?Sized> Default for EventHub<K, C, A> {
    fn default() -> Self {
        Self::new()
    }
}
