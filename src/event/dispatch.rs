use std::{
    collections::{HashMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc, Mutex,
    },
    thread,
    time::Instant,
};

use log::{debug, warn};

use crate::{
    config::DispatchConfig,
    event::{context, Event, EventCallback},
    Error, Result,
};

/// A producer of events, typically a hypervisor backend's VM-exit stream.
pub trait EventSource: Send {
    /// Blocks until the next event is available. `Ok(None)` ends the stream.
    ///
    /// # Errors
    /// Any backend failure; it stops the dispatch loop.
    fn next_event(&mut self) -> Result<Option<Event>>;
}

/// An [`EventSource`] that replays a fixed list of events.
///
/// Useful for tests and for re-processing recorded traces.
#[derive(Debug, Default)]
pub struct ReplaySource {
    events: VecDeque<Event>,
}

impl ReplaySource {
    /// Creates a source yielding `events` in order.
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        ReplaySource {
            events: events.into_iter().collect(),
        }
    }

    /// Events not yet handed out
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl EventSource for ReplaySource {
    fn next_event(&mut self) -> Result<Option<Event>> {
        Ok(self.events.pop_front())
    }
}

/// Delivers events to an [`EventCallback`].
///
/// Every delivery installs the event in the handling thread's [`context`] for exactly the
/// duration of `process_event`, and removes it again on every exit path.
///
/// [`EventDispatcher::run`] gives each VCPU its own worker thread fed by a bounded queue of
/// [`DispatchConfig::queue_depth`] events. Events of one VCPU are handled in the order the
/// source produced them; events of different VCPUs are not ordered. A full queue blocks the
/// source, which keeps the VCPU paused until its handler catches up.
pub struct EventDispatcher {
    callback: Arc<dyn EventCallback>,
    config: DispatchConfig,
    delivered: AtomicU64,
}

impl EventDispatcher {
    /// Creates a dispatcher for `callback`.
    pub fn new(callback: Arc<dyn EventCallback>, config: DispatchConfig) -> Self {
        EventDispatcher {
            callback,
            config,
            delivered: AtomicU64::new(0),
        }
    }

    /// Number of events handed to the callback so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Delivers a single event on the calling thread.
    pub fn deliver(&self, event: Event) {
        let event = Arc::new(event);
        let started = Instant::now();
        {
            let _scope = context::enter(event.clone());
            self.callback.process_event(&event);
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_handler_threshold {
            warn!(
                "Handler for {} took {:?} (threshold {:?})",
                event, elapsed, self.config.slow_handler_threshold
            );
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Pulls events from `source` until it is exhausted and delivers them on per-VCPU worker
    /// threads. Returns once every queued event has been handled.
    ///
    /// # Errors
    /// The first error of the source, or [`Error::Error`] if a handler panicked. Either stops
    /// the loop. After a panic no further events are pulled from the source, and events still
    /// queued for any VCPU are dropped undelivered.
    pub fn run(&self, source: &mut dyn EventSource) -> Result<u64> {
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        let stopped = AtomicBool::new(false);
        let before = self.delivered();

        thread::scope(|scope| -> Result<()> {
            let mut queues: HashMap<u32, SyncSender<Event>> = HashMap::new();

            let outcome = loop {
                if stopped.load(Ordering::Acquire) {
                    break Ok(());
                }
                let event = match source.next_event() {
                    Ok(Some(event)) => event,
                    Ok(None) => break Ok(()),
                    Err(error) => break Err(error),
                };

                let vcpu = event.vcpu();
                let queue = queues.entry(vcpu).or_insert_with(|| {
                    let (sender, receiver) = mpsc::sync_channel(self.config.queue_depth);
                    let (failure, stopped) = (&failure, &stopped);
                    debug!("Starting event worker for vcpu {vcpu}");
                    scope.spawn(move || self.worker(vcpu, receiver, failure, stopped));
                    sender
                });

                // A closed queue means the worker stopped after a handler panic.
                if queue.send(event).is_err() {
                    break Ok(());
                }
            };

            // Closing the queues lets the workers drain and exit.
            drop(queues);
            outcome
        })?;

        if let Some(error) = lock!(failure).take() {
            return Err(error);
        }

        let count = self.delivered() - before;
        debug!("Event stream ended after {count} events");
        Ok(count)
    }

    fn worker(
        &self,
        vcpu: u32,
        receiver: Receiver<Event>,
        failure: &Mutex<Option<Error>>,
        stopped: &AtomicBool,
    ) {
        for event in receiver {
            if stopped.load(Ordering::Acquire) {
                debug!("Event worker for vcpu {vcpu} dropping queued events after a handler panic");
                return;
            }
            let id = event.id();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.deliver(event)));
            if outcome.is_err() {
                let error = Error::Error(format!(
                    "handler panicked on event {id} (vcpu {vcpu})"
                ));
                if let Err(error) = Self::record(failure, error) {
                    warn!("Could not record handler failure: {error}");
                }
                stopped.store(true, Ordering::Release);
                return;
            }
        }
        debug!("Event worker for vcpu {vcpu} finished");
    }

    fn record(failure: &Mutex<Option<Error>>, error: Error) -> Result<()> {
        let mut slot = lock!(failure);
        if slot.is_none() {
            *slot = Some(error);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &self.config)
            .field("delivered", &self.delivered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{arch::x86::Registers, event::EventDetail};

    fn event(id: u64, vcpu: u32) -> Event {
        Event::new(
            id,
            1,
            vcpu,
            Arc::new(Registers::default()),
            EventDetail::SingleStep,
        )
    }

    #[test]
    fn deliver_scopes_the_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = EventDispatcher::new(
            Arc::new(move |event: &Event| {
                let active = context::get().unwrap();
                sink.lock().unwrap().push((event.id(), active.id()));
            }),
            DispatchConfig::default(),
        );

        context::clear();
        dispatcher.deliver(event(5, 0));
        assert!(!context::active());
        assert_eq!(*seen.lock().unwrap(), vec![(5, 5)]);
        assert_eq!(dispatcher.delivered(), 1);
    }

    #[test]
    fn per_vcpu_order_is_preserved() {
        let seen: Arc<Mutex<HashMap<u32, Vec<u64>>>> = Arc::new(Mutex::new(HashMap::new()));
        let sink = seen.clone();
        let dispatcher = EventDispatcher::new(
            Arc::new(move |event: &Event| {
                let current = context::get().unwrap();
                assert_eq!(current.id(), event.id());
                sink.lock()
                    .unwrap()
                    .entry(event.vcpu())
                    .or_default()
                    .push(event.id());
            }),
            DispatchConfig::default().with_queue_depth(2),
        );

        let events: Vec<Event> = (0..40).map(|id| event(id, (id % 4) as u32)).collect();
        let mut source = ReplaySource::new(events);
        assert_eq!(dispatcher.run(&mut source).unwrap(), 40);
        assert_eq!(source.remaining(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for (vcpu, ids) in seen.iter() {
            let expected: Vec<u64> = (0..40).filter(|id| id % 4 == u64::from(*vcpu)).collect();
            assert_eq!(ids, &expected);
        }
    }

    struct FailingSource(u32);

    impl EventSource for FailingSource {
        fn next_event(&mut self) -> Result<Option<Event>> {
            if self.0 == 0 {
                return Err(Error::Error("backend went away".to_string()));
            }
            self.0 -= 1;
            Ok(Some(event(u64::from(self.0), 0)))
        }
    }

    #[test]
    fn source_errors_stop_the_loop() {
        let dispatcher = EventDispatcher::new(
            Arc::new(|_: &Event| {}),
            DispatchConfig::default(),
        );
        let result = dispatcher.run(&mut FailingSource(3));
        assert!(matches!(result, Err(Error::Error(ref message)) if message == "backend went away"));
        assert_eq!(dispatcher.delivered(), 3);
    }

    #[test]
    fn handler_panics_are_reported() {
        let dispatcher = EventDispatcher::new(
            Arc::new(|event: &Event| {
                if event.id() == 1 {
                    panic!("bad event");
                }
            }),
            DispatchConfig::default().with_slow_handler_threshold(Duration::from_secs(5)),
        );
        let mut source = ReplaySource::new((0..3).map(|id| event(id, 0)));
        assert!(matches!(dispatcher.run(&mut source), Err(Error::Error(_))));
    }

    /// VCPU 0 panics once, then only VCPU 1 keeps producing events.
    struct QuietAfterPanic {
        pulled: u64,
        limit: u64,
    }

    impl EventSource for QuietAfterPanic {
        fn next_event(&mut self) -> Result<Option<Event>> {
            if self.pulled == self.limit {
                return Ok(None);
            }
            let vcpu = if self.pulled == 0 { 0 } else { 1 };
            if vcpu == 1 {
                thread::sleep(Duration::from_millis(1));
            }
            self.pulled += 1;
            Ok(Some(event(self.pulled, vcpu)))
        }
    }

    #[test]
    fn handler_panic_stops_other_vcpus() {
        let after_panic = Arc::new(AtomicU64::new(0));
        let counter = after_panic.clone();
        let dispatcher = EventDispatcher::new(
            Arc::new(move |event: &Event| {
                if event.vcpu() == 0 {
                    panic!("bad event");
                }
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            DispatchConfig::default(),
        );

        let mut source = QuietAfterPanic {
            pulled: 0,
            limit: 10_000,
        };
        assert!(matches!(dispatcher.run(&mut source), Err(Error::Error(_))));
        assert!(source.pulled < source.limit);
        assert!(after_panic.load(Ordering::Relaxed) < source.limit - 1);
    }
}
