//! Keyboard event tap using macOS CGEventTap
//!
//! Runs on a dedicated thread with its own CFRunLoop. The tap filters
//! actively: an event can only be dropped from inside the tap callback,
//! so the hold detector lives on this thread and timeout firings are
//! delivered between run-loop slices — everything the detector sees
//! arrives on one logical sequence.
//!
//! Requires the Accessibility permission (System Settings > Privacy &
//! Security > Accessibility).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use core_foundation::runloop::{kCFRunLoopCommonModes, kCFRunLoopDefaultMode, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventTapProxy, CGEventType, CallbackResult, EventField,
};
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::detector::{DeadlineScheduler, Decision, HoldDetector};
use crate::events::DetectorEvent;

use super::event::{KeyDirection, KeyEvent};
use super::keys::{KeyCode, ModifierSet};

/// Marker stored in the user-data field of injected events.
///
/// Events posted at the HID tap point re-enter session-level taps; the
/// marker lets the callback pass its own output through untouched instead
/// of re-capturing a replayed key-down.
const INJECTED_MARKER: i64 = 0x484f4c44;

/// Longest the run loop sleeps between timer and shutdown checks
const RUN_LOOP_SLICE: Duration = Duration::from_millis(100);

/// Errors that can occur in the event tap
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("event tap is already running")]
    AlreadyRunning,

    #[error("failed to create event tap - check Accessibility permissions")]
    TapCreation,

    #[error("failed to create event source for injection")]
    EventSource,

    #[error("failed to synthesize keyboard event")]
    Synthesis,

    #[error("failed to spawn tap thread: {0}")]
    ThreadSpawn(String),
}

/// System-wide keyboard tap feeding the hold detector
pub struct EventTap {
    key_code: KeyCode,
    key_name: String,
    hold_delay: Duration,
    event_tx: broadcast::Sender<DetectorEvent>,
    running: Arc<AtomicBool>,
}

impl EventTap {
    /// Create a new event tap for the designated key
    pub fn new(
        key_code: KeyCode,
        key_name: impl Into<String>,
        hold_delay: Duration,
        event_tx: broadcast::Sender<DetectorEvent>,
    ) -> Self {
        Self {
            key_code,
            key_name: key_name.into(),
            hold_delay,
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the tap on a dedicated thread.
    ///
    /// The thread runs until `stop()` is called or the program exits.
    pub fn start(&self) -> Result<(), TapError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TapError::AlreadyRunning);
        }

        let running = Arc::clone(&self.running);
        let detector = HoldDetector::new(
            self.key_code,
            self.key_name.clone(),
            self.hold_delay,
            DeadlineScheduler::new(),
            self.event_tx.clone(),
        );

        let spawned = thread::Builder::new()
            .name("event-tap".to_string())
            .spawn(move || {
                info!("event tap thread started");

                if let Err(e) = run_tap_loop(detector, running.clone()) {
                    error!(?e, "event tap error");
                }

                running.store(false, Ordering::SeqCst);
                info!("event tap thread stopped");
            });

        if let Err(e) = spawned {
            self.running.store(false, Ordering::SeqCst);
            return Err(TapError::ThreadSpawn(e.to_string()));
        }

        Ok(())
    }

    /// Stop the tap; the thread exits within one run-loop slice
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Check if the tap thread is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Run the CFRunLoop with the event tap and the embedded detector
fn run_tap_loop(
    detector: HoldDetector<DeadlineScheduler>,
    running: Arc<AtomicBool>,
) -> Result<(), TapError> {
    let detector = Rc::new(RefCell::new(detector));
    let injector = Injector::new()?;
    // Set by the callback when macOS disables the tap; the loop re-enables.
    let reenable = Rc::new(Cell::new(false));

    let cb_detector = Rc::clone(&detector);
    let cb_reenable = Rc::clone(&reenable);

    let callback = move |_proxy: CGEventTapProxy,
                         event_type: CGEventType,
                         event: &CGEvent|
          -> CallbackResult {
        match event_type {
            CGEventType::TapDisabledByTimeout | CGEventType::TapDisabledByUserInput => {
                warn!("event tap disabled by system, forwarding and resetting");
                cb_reenable.set(true);
                cb_detector.borrow_mut().on_tap_interrupted();
                return CallbackResult::Keep;
            }
            CGEventType::KeyDown | CGEventType::KeyUp => {}
            _ => return CallbackResult::Keep,
        }

        // Echoes of our own injected events have already been decided.
        if event.get_integer_value_field(EventField::EVENT_SOURCE_USER_DATA) == INJECTED_MARKER {
            return CallbackResult::Keep;
        }

        let key_event = normalize(event_type, event);
        let decision = cb_detector.borrow_mut().handle(&key_event);

        match decision {
            Decision::Forward => CallbackResult::Keep,
            Decision::Swallow => CallbackResult::Drop,
            Decision::SwallowAndInject(events) => {
                injector.post_all(&events);
                CallbackResult::Drop
            }
        }
    };

    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::Default,
        vec![CGEventType::KeyDown, CGEventType::KeyUp],
        callback,
    )
    .map_err(|_| {
        error!("failed to create event tap - is Accessibility permission granted?");
        TapError::TapCreation
    })?;

    tap.enable();

    let run_loop_source = tap
        .mach_port()
        .create_runloop_source(0)
        .map_err(|_| TapError::TapCreation)?;
    let run_loop = CFRunLoop::get_current();

    unsafe {
        run_loop.add_source(&run_loop_source, kCFRunLoopCommonModes);
    }

    info!("event tap created and enabled");

    while running.load(Ordering::SeqCst) {
        // Sleep until the hold deadline if one is armed, otherwise a full
        // slice. Key events wake the loop early; the timer check below
        // runs on this same thread, after any in-flight callback.
        let wait = detector
            .borrow()
            .next_deadline()
            .map(|deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(RUN_LOOP_SLICE)
            })
            .unwrap_or(RUN_LOOP_SLICE);

        CFRunLoop::run_in_mode(unsafe { kCFRunLoopDefaultMode }, wait, true);

        detector.borrow_mut().poll_timeout(Instant::now());

        if reenable.replace(false) {
            info!("re-enabling event tap");
            tap.enable();
        }
    }

    Ok(())
}

/// Normalize a raw keyboard event
fn normalize(event_type: CGEventType, event: &CGEvent) -> KeyEvent {
    let direction = match event_type {
        CGEventType::KeyDown => KeyDirection::Down,
        _ => KeyDirection::Up,
    };

    KeyEvent {
        direction,
        key_code: event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE) as KeyCode,
        modifiers: ModifierSet::from_flags(event.get_flags()),
        is_repeat: event.get_integer_value_field(EventField::KEYBOARD_EVENT_AUTOREPEAT) != 0,
    }
}

/// Posts synthetic keyboard events back into the HID stream
struct Injector {
    source: CGEventSource,
}

impl Injector {
    fn new() -> Result<Self, TapError> {
        let source = CGEventSource::new(CGEventSourceStateID::HIDSystemState)
            .map_err(|_| TapError::EventSource)?;
        Ok(Self { source })
    }

    /// Post synthetic events in order.
    ///
    /// Runs inside the tap callback, before the triggering event's
    /// disposition is returned, so ordering relative to subsequent real
    /// events is preserved. A failed injection is logged and skipped: the
    /// detector has already reset itself, and a missed replay is less
    /// harmful than a permanently suppressed key.
    fn post_all(&self, events: &[KeyEvent]) {
        for key_event in events {
            if let Err(e) = self.post(key_event) {
                error!(?e, key_code = key_event.key_code, "failed to inject event");
            }
        }
    }

    fn post(&self, key_event: &KeyEvent) -> Result<(), TapError> {
        let keydown = key_event.direction == KeyDirection::Down;
        let event = CGEvent::new_keyboard_event(self.source.clone(), key_event.key_code, keydown)
            .map_err(|_| TapError::Synthesis)?;
        event.set_integer_value_field(EventField::EVENT_SOURCE_USER_DATA, INJECTED_MARKER);
        event.post(CGEventTapLocation::HID);
        Ok(())
    }
}
