//! Integration tests for event delivery and the thread-local event context.
//!
//! Handlers here behave like structure parsers: they do not receive the event as a parameter
//! but recover it from the context.

use std::{
    collections::HashMap,
    sync::{Arc, Barrier, Mutex},
    thread,
};

use vmscope::{
    arch::x86::{Exception, Registers},
    config::DispatchConfig,
    event::{context, Event, EventDetail, EventDispatcher, ExceptionEvent, ReplaySource},
    Error, Result,
};

fn exception(id: u64, vcpu: u32, vector: Exception) -> Event {
    let registers = Registers {
        rip: 0xfffff800_0000_0000 + id,
        ..Default::default()
    };
    Event::new(
        id,
        4,
        vcpu,
        Arc::new(registers),
        EventDetail::Exception(ExceptionEvent::new(vector, None)),
    )
}

/// Deeply nested code that only knows about the context.
fn faulting_rip() -> Result<u64> {
    context::with(|event| event.registers().rip)
}

#[test]
fn test_context_is_absent_outside_handlers() {
    context::clear();
    assert!(!context::active());
    assert!(matches!(context::get(), Err(Error::InvalidMethod(_))));
    assert!(matches!(faulting_rip(), Err(Error::InvalidMethod(_))));
}

#[test]
fn test_context_is_thread_isolated() {
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4u64)
        .map(|id| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                context::set(Arc::new(exception(id, 0, Exception::Int3)));
                // Every thread has set its event before any of them reads.
                barrier.wait();
                let seen = context::get().map(|event| event.id());
                context::clear();
                (id, seen, context::active())
            })
        })
        .collect();

    for handle in handles {
        let (id, seen, still_active) = handle.join().unwrap();
        assert_eq!(seen.unwrap(), id);
        assert!(!still_active);
    }
}

#[test]
fn test_dispatcher_publishes_each_event() -> Result<()> {
    let seen: Arc<Mutex<HashMap<u32, Vec<(u64, u64, String)>>>> = Arc::default();
    let sink = seen.clone();

    let dispatcher = EventDispatcher::new(
        Arc::new(move |event: &Event| {
            let rip = faulting_rip().unwrap();
            let vector = context::get().unwrap().exception().unwrap().vector();
            sink.lock()
                .unwrap()
                .entry(event.vcpu())
                .or_default()
                .push((event.id(), rip, vector.to_string()));
        }),
        DispatchConfig::default(),
    );

    let events = (0..12).map(|id| {
        let vector = if id % 2 == 0 {
            Exception::PageFault
        } else {
            Exception::GpFault
        };
        exception(id, (id % 3) as u32, vector)
    });
    let delivered = dispatcher.run(&mut ReplaySource::new(events))?;
    assert_eq!(delivered, 12);

    let seen = seen.lock().unwrap();
    for vcpu in 0..3u32 {
        let handled = &seen[&vcpu];
        let ids: Vec<u64> = handled.iter().map(|(id, _, _)| *id).collect();
        let expected: Vec<u64> = (0..12).filter(|id| id % 3 == u64::from(vcpu)).collect();
        assert_eq!(ids, expected);

        for (id, rip, vector) in handled {
            assert_eq!(*rip, 0xfffff800_0000_0000 + id);
            let expected = if id % 2 == 0 { "PAGE_FAULT" } else { "GP_FAULT" };
            assert_eq!(vector, expected);
        }
    }

    context::clear();
    Ok(())
}

#[test]
fn test_capability_queries() {
    let event = exception(1, 0, Exception::PageFault);
    assert!(event.as_exception().is_some());
    assert!(event.as_msr().is_none());
    assert!(matches!(event.control_register(), Err(Error::InvalidMethod(_))));

    let step = Event::new(2, 0, 0, Arc::new(Registers::default()), EventDetail::SingleStep);
    assert!(matches!(step.exception(), Err(Error::InvalidMethod(_))));
}
