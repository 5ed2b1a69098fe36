use crate::event::Event;

/// A consumer of delivered events.
///
/// `process_event` is called synchronously, once per occurrence, on the thread that handles the
/// event's VCPU. While it runs the VCPU cannot be resumed, so implementations must return
/// promptly. The event must not be retained past the call.
///
/// Closures taking `&Event` implement this trait.
pub trait EventCallback: Send + Sync {
    /// Handles one event.
    fn process_event(&self, event: &Event);
}

impl<F> EventCallback for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn process_event(&self, event: &Event) {
        self(event)
    }
}
