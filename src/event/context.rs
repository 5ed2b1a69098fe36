//! The event currently being handled on this thread.
//!
//! Structure parsers that sit many call frames below the dispatch loop use this to recover the
//! VCPU state they are interpreting memory for, without every intermediate function passing the
//! event along. Each thread has its own slot, so no locking is involved and a thread never
//! observes another thread's event.
//!
//! [`enter`] is the preferred way to install an event: the returned [`EventScope`] restores the
//! previous slot contents on every exit path, including unwinding. [`set`] and [`clear`] are the
//! plain last-write-wins primitives.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use vmscope::arch::x86::Registers;
//! use vmscope::event::{context, Event, EventDetail};
//!
//! let event = Arc::new(Event::new(1, 0, 0, Arc::new(Registers::default()), EventDetail::SingleStep));
//! assert!(!context::active());
//! {
//!     let _scope = context::enter(event.clone());
//!     assert_eq!(context::get()?.id(), 1);
//! }
//! assert!(context::get().is_err());
//! # Ok::<(), vmscope::Error>(())
//! ```

use std::{cell::RefCell, marker::PhantomData, sync::Arc};

use crate::{event::Event, Error, Result};

thread_local! {
    static ACTIVE_EVENT: RefCell<Option<Arc<Event>>> = const { RefCell::new(None) };
}

/// Installs `event` as this thread's active event, replacing any previous one.
pub fn set(event: Arc<Event>) {
    ACTIVE_EVENT.with(|slot| *slot.borrow_mut() = Some(event));
}

/// Returns this thread's active event.
///
/// # Errors
/// [`Error::InvalidMethod`] if no event is active.
pub fn get() -> Result<Arc<Event>> {
    ACTIVE_EVENT
        .with(|slot| slot.borrow().clone())
        .ok_or(Error::InvalidMethod("no event is active on this thread"))
}

/// Runs `f` with a reference to this thread's active event, without cloning the handle.
///
/// # Errors
/// [`Error::InvalidMethod`] if no event is active.
pub fn with<R>(f: impl FnOnce(&Event) -> R) -> Result<R> {
    let event = get()?;
    Ok(f(&event))
}

/// Returns `true` if an event is active on this thread.
#[must_use]
pub fn active() -> bool {
    ACTIVE_EVENT.with(|slot| slot.borrow().is_some())
}

/// Removes this thread's active event, if any.
pub fn clear() {
    ACTIVE_EVENT.with(|slot| *slot.borrow_mut() = None);
}

/// Installs `event` for the lifetime of the returned guard.
///
/// Scopes nest: dropping the guard restores whatever was active before.
#[must_use = "the event is only active while the scope is alive"]
pub fn enter(event: Arc<Event>) -> EventScope {
    let previous = ACTIVE_EVENT.with(|slot| slot.borrow_mut().replace(event));
    EventScope {
        previous,
        _not_send: PhantomData,
    }
}

/// Guard returned by [`enter`].
///
/// Bound to the thread that created it.
#[derive(Debug)]
pub struct EventScope {
    previous: Option<Arc<Event>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EventScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The slot may already be torn down if the thread is exiting.
        let _ = ACTIVE_EVENT.try_with(|slot| *slot.borrow_mut() = previous);
    }
}
