//! Hold detector state machine
//!
//! Consumes the normalized key stream one event at a time and decides,
//! for each event, whether to forward it, swallow it, or swallow it and
//! inject replacement events. A press of the designated key is
//! speculatively swallowed until it is either released (an ordinary tap,
//! replayed verbatim), interrupted by another key (the capture is
//! abandoned and both events replayed in order), or sustained past the
//! hold delay (the hold fires and the key stays suppressed until
//! release).
//!
//! The detector has no internal locking: events and timeout firings must
//! arrive one at a time on a single logical thread of control.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::DetectorEvent;
use crate::tap::{KeyCode, KeyDirection, KeyEvent};

use super::scheduler::{Scheduler, TimerId};

/// The three phases of hold detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    /// Nothing captured, events pass through
    Idle,
    /// The designated key is down and swallowed, waiting out the hold delay
    AwaitingHold,
    /// The hold fired; the key stays suppressed until released
    PostHold,
}

impl Default for HoldState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for HoldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldState::Idle => write!(f, "Idle"),
            HoldState::AwaitingHold => write!(f, "AwaitingHold"),
            HoldState::PostHold => write!(f, "PostHold"),
        }
    }
}

/// What the event source must do with the event just handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Deliver the event unchanged
    Forward,
    /// Drop the event from the stream
    Swallow,
    /// Drop the event and post these synthetic events, in order
    SwallowAndInject(Vec<KeyEvent>),
}

/// The hold detector
///
/// Owns all mutable detection state: the current phase, the swallowed
/// key-down awaiting its verdict, the armed hold timer, and the count of
/// keys physically down.
pub struct HoldDetector<S: Scheduler> {
    /// Key code of the designated key
    key_code: KeyCode,
    /// Display name reported in notifications
    key_name: String,
    /// How long the key must stay down to count as a hold
    hold_delay: Duration,
    /// Current phase
    state: HoldState,
    /// The swallowed key-down that opened `AwaitingHold`
    pending_down: Option<KeyEvent>,
    /// Armed hold timer; `Some` exactly while `AwaitingHold`
    pending_timer: Option<TimerId>,
    /// Keys currently physically down, any key, clamped at zero
    held_keys: i32,
    /// Timeout source
    scheduler: S,
    /// Channel for emitting hold notifications
    event_tx: broadcast::Sender<DetectorEvent>,
    /// When the current hold fired, for `HoldEnded` durations
    held_since: Option<Instant>,
}

impl<S: Scheduler> HoldDetector<S> {
    /// Create a new detector in `Idle`
    pub fn new(
        key_code: KeyCode,
        key_name: impl Into<String>,
        hold_delay: Duration,
        scheduler: S,
        event_tx: broadcast::Sender<DetectorEvent>,
    ) -> Self {
        Self {
            key_code,
            key_name: key_name.into(),
            hold_delay,
            state: HoldState::Idle,
            pending_down: None,
            pending_timer: None,
            held_keys: 0,
            scheduler,
            event_tx,
            held_since: None,
        }
    }

    /// Current phase
    pub fn state(&self) -> HoldState {
        self.state
    }

    /// Handle one key event, in arrival order
    pub fn handle(&mut self, event: &KeyEvent) -> Decision {
        match event.direction {
            KeyDirection::Down if !event.is_repeat => self.held_keys += 1,
            KeyDirection::Up => self.held_keys = (self.held_keys - 1).max(0),
            _ => {}
        }

        // A modified chord can never be a hold. The key-down may have been
        // plain while its key-up arrives modified, so make sure nothing
        // stays partially suppressed before forwarding.
        if event.modifiers.any() {
            self.reset_to_idle();
            return Decision::Forward;
        }

        match self.state {
            HoldState::Idle => self.handle_idle(event),
            HoldState::AwaitingHold => self.handle_awaiting(event),
            HoldState::PostHold => self.handle_post_hold(event),
        }
    }

    /// Idle: watch for a lone press of the designated key
    fn handle_idle(&mut self, event: &KeyEvent) -> Decision {
        let starts_hold = event.direction == KeyDirection::Down
            && !event.is_repeat
            && event.key_code == self.key_code
            && self.held_keys == 1;

        if !starts_hold {
            return Decision::Forward;
        }

        debug_assert!(self.pending_timer.is_none());
        self.pending_down = Some(event.clone());
        self.pending_timer = Some(self.scheduler.arm(self.hold_delay));
        self.state = HoldState::AwaitingHold;
        debug!(key = %self.key_name, "hold candidate captured");
        Decision::Swallow
    }

    /// AwaitingHold: decide between tap, abandoned candidate, and hold
    fn handle_awaiting(&mut self, event: &KeyEvent) -> Decision {
        if event.direction == KeyDirection::Down
            && event.is_repeat
            && event.key_code == self.key_code
        {
            return Decision::Swallow;
        }

        if event.direction == KeyDirection::Up && event.key_code == self.key_code {
            // Released before the delay: an ordinary tap. Replay the
            // captured down and a derived up so downstream consumers see
            // the keystroke untouched.
            self.cancel_timer();
            let down = match self.pending_down.take() {
                Some(down) => down,
                None => return self.force_reset("designated key-up without a captured down"),
            };
            self.state = HoldState::Idle;
            debug!(key = %self.key_name, "tap detected, replaying");
            let up = down.released();
            return Decision::SwallowAndInject(vec![down, up]);
        }

        if event.direction == KeyDirection::Down && event.key_code != self.key_code {
            // Another key interleaved: abandon the candidate and replay
            // both events in arrival order so no input is lost.
            self.cancel_timer();
            let down = match self.pending_down.take() {
                Some(down) => down,
                None => return self.force_reset("interrupting key-down without a captured down"),
            };
            self.state = HoldState::Idle;
            debug!(
                key = %self.key_name,
                interrupting = event.key_code,
                "hold candidate abandoned"
            );
            return Decision::SwallowAndInject(vec![down, event.clone()]);
        }

        // Everything else (e.g. the release of a key that was already down
        // when the capture started) is consumed while the hold is pending.
        Decision::Swallow
    }

    /// PostHold: the key's normal effect is consumed until release
    fn handle_post_hold(&mut self, event: &KeyEvent) -> Decision {
        if event.direction == KeyDirection::Up && event.key_code == self.key_code {
            self.state = HoldState::Idle;
            self.emit_hold_ended();
            info!(key = %self.key_name, "hold released");
            return Decision::Swallow;
        }

        Decision::Swallow
    }

    /// Deliver a timeout firing.
    ///
    /// Stale firings (canceled or superseded timers) are no-ops, guarding
    /// the race between cancellation and a firing already in flight.
    pub fn on_hold_timeout(&mut self, timer: TimerId) {
        if self.pending_timer != Some(timer) {
            debug!(?timer, "ignoring stale hold timeout");
            return;
        }
        if self.state != HoldState::AwaitingHold {
            self.force_reset("hold timeout fired outside AwaitingHold");
            return;
        }

        self.pending_timer = None;
        self.pending_down = None;
        self.state = HoldState::PostHold;
        self.held_since = Some(Instant::now());
        info!(key = %self.key_name, "key held");
        let _ = self.event_tx.send(DetectorEvent::KeyHeld {
            key: self.key_name.clone(),
        });
    }

    /// Fire the hold timeout if its deadline has passed.
    ///
    /// Must be called on the same logical sequence that delivers key
    /// events; the tap thread does so between run-loop slices.
    pub fn poll_timeout(&mut self, now: Instant) {
        if let Some(timer) = self.scheduler.due(now) {
            self.on_hold_timeout(timer);
        }
    }

    /// Deadline of the armed hold timer, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// The tap reported it was disabled (timeout or user action).
    ///
    /// The suppression guarantee is void for the disabled window, so a
    /// capture in flight can no longer be replayed coherently; drop it and
    /// start over from `Idle`.
    pub fn on_tap_interrupted(&mut self) {
        if self.state != HoldState::Idle {
            warn!(state = %self.state, "event tap interrupted mid-capture");
        }
        self.reset_to_idle();
        self.held_keys = 0;
        let _ = self.event_tx.send(DetectorEvent::TapInterrupted);
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            self.scheduler.cancel(timer);
        }
    }

    fn reset_to_idle(&mut self) {
        self.cancel_timer();
        self.pending_down = None;
        if self.state == HoldState::PostHold {
            self.emit_hold_ended();
        }
        self.state = HoldState::Idle;
    }

    fn emit_hold_ended(&mut self) {
        let held_ms = self
            .held_since
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let _ = self.event_tx.send(DetectorEvent::HoldEnded {
            key: self.key_name.clone(),
            held_ms,
        });
    }

    /// Recovery for states that correct event ordering can never produce.
    ///
    /// Debug builds treat them as defects; release builds degrade to
    /// "stop intercepting" by discarding the capture and timer.
    fn force_reset(&mut self, context: &'static str) -> Decision {
        debug_assert!(false, "invariant violation: {context}");
        error!(context, state = %self.state, "invariant violation, resetting detector");
        self.reset_to_idle();
        Decision::Forward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::{ModifierSet, SPACE};

    const KEY_A: KeyCode = 0;
    const KEY_B: KeyCode = 11;

    fn detector() -> (
        HoldDetector<TestScheduler>,
        broadcast::Receiver<DetectorEvent>,
    ) {
        let (tx, rx) = broadcast::channel(16);
        let det = HoldDetector::new(
            SPACE,
            "space",
            Duration::from_millis(250),
            TestScheduler::default(),
            tx,
        );
        (det, rx)
    }

    fn down(key_code: KeyCode) -> KeyEvent {
        KeyEvent {
            direction: KeyDirection::Down,
            key_code,
            modifiers: ModifierSet::default(),
            is_repeat: false,
        }
    }

    fn up(key_code: KeyCode) -> KeyEvent {
        KeyEvent {
            direction: KeyDirection::Up,
            ..down(key_code)
        }
    }

    fn repeat(key_code: KeyCode) -> KeyEvent {
        KeyEvent {
            is_repeat: true,
            ..down(key_code)
        }
    }

    fn shifted(mut event: KeyEvent) -> KeyEvent {
        event.modifiers.shift = true;
        event
    }

    /// Fire the armed timer, panicking if none is armed
    fn fire_timeout(det: &mut HoldDetector<TestScheduler>) {
        let timer = det.scheduler.armed.expect("no timer armed");
        det.on_hold_timeout(timer);
    }

    /// Virtual scheduler: arming records the request, firing is driven
    /// explicitly by the test
    #[derive(Debug, Default)]
    struct TestScheduler {
        next_id: u64,
        armed: Option<TimerId>,
        canceled: Vec<TimerId>,
    }

    impl Scheduler for TestScheduler {
        fn arm(&mut self, _delay: Duration) -> TimerId {
            self.next_id += 1;
            let id = TimerId(self.next_id);
            self.armed = Some(id);
            id
        }

        fn cancel(&mut self, timer: TimerId) {
            if self.armed == Some(timer) {
                self.armed = None;
            }
            self.canceled.push(timer);
        }

        fn due(&mut self, _now: Instant) -> Option<TimerId> {
            None
        }

        fn next_deadline(&self) -> Option<Instant> {
            None
        }
    }

    // Scenario A: a quick tap is swallowed and replayed verbatim.
    #[test]
    fn test_tap_faster_than_delay_is_replayed() {
        let (mut det, mut rx) = detector();

        assert_eq!(det.handle(&down(SPACE)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::AwaitingHold);
        let armed = det.scheduler.armed.unwrap();

        let decision = det.handle(&up(SPACE));
        assert_eq!(
            decision,
            Decision::SwallowAndInject(vec![down(SPACE), up(SPACE)])
        );
        assert_eq!(det.state(), HoldState::Idle);

        // Timer canceled, capture cleared, no notification.
        assert!(det.scheduler.canceled.contains(&armed));
        assert!(det.pending_timer.is_none());
        assert!(det.pending_down.is_none());
        assert!(rx.try_recv().is_err());
    }

    // Scenario B: holding past the delay fires exactly one notification
    // and the key's own events never reach downstream.
    #[test]
    fn test_hold_past_delay_fires_once() {
        let (mut det, mut rx) = detector();

        assert_eq!(det.handle(&down(SPACE)), Decision::Swallow);
        fire_timeout(&mut det);
        assert_eq!(det.state(), HoldState::PostHold);
        assert!(matches!(
            rx.try_recv(),
            Ok(DetectorEvent::KeyHeld { ref key }) if key == "space"
        ));

        // Repeats while held are consumed.
        assert_eq!(det.handle(&repeat(SPACE)), Decision::Swallow);

        // Release ends the hold without replaying anything.
        assert_eq!(det.handle(&up(SPACE)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::Idle);
        assert!(matches!(rx.try_recv(), Ok(DetectorEvent::HoldEnded { .. })));
        assert!(rx.try_recv().is_err());
    }

    // Scenario C: another key during AwaitingHold abandons the candidate
    // and replays both events in arrival order.
    #[test]
    fn test_interrupting_key_cancels_hold() {
        let (mut det, mut rx) = detector();

        assert_eq!(det.handle(&down(SPACE)), Decision::Swallow);
        let armed = det.scheduler.armed.unwrap();

        let decision = det.handle(&down(KEY_A));
        assert_eq!(
            decision,
            Decision::SwallowAndInject(vec![down(SPACE), down(KEY_A)])
        );
        assert_eq!(det.state(), HoldState::Idle);
        assert!(det.scheduler.canceled.contains(&armed));
        assert!(rx.try_recv().is_err());
    }

    // Scenario D: a modified chord is forwarded unchanged from Idle.
    #[test]
    fn test_modified_chord_forwarded_from_idle() {
        let (mut det, _rx) = detector();

        assert_eq!(det.handle(&shifted(down(SPACE))), Decision::Forward);
        assert_eq!(det.state(), HoldState::Idle);
    }

    #[test]
    fn test_modifier_forces_idle_mid_capture() {
        let (mut det, _rx) = detector();

        assert_eq!(det.handle(&down(SPACE)), Decision::Swallow);
        let armed = det.scheduler.armed.unwrap();

        // The key-down was plain Space but the key-up arrives as
        // Shift-Space: forward it and tear the capture down.
        assert_eq!(det.handle(&shifted(up(SPACE))), Decision::Forward);
        assert_eq!(det.state(), HoldState::Idle);
        assert!(det.scheduler.canceled.contains(&armed));
        assert!(det.pending_down.is_none());
    }

    #[test]
    fn test_repeat_never_resets_timer() {
        let (mut det, _rx) = detector();

        det.handle(&down(SPACE));
        let armed = det.scheduler.armed.unwrap();

        assert_eq!(det.handle(&repeat(SPACE)), Decision::Swallow);
        assert_eq!(det.handle(&repeat(SPACE)), Decision::Swallow);

        // Still the original timer: never re-armed, never canceled.
        assert_eq!(det.scheduler.armed, Some(armed));
        assert_eq!(det.scheduler.next_id, 1);
        assert_eq!(det.state(), HoldState::AwaitingHold);
    }

    #[test]
    fn test_post_hold_swallows_everything_until_release() {
        let (mut det, _rx) = detector();

        det.handle(&down(SPACE));
        fire_timeout(&mut det);

        assert_eq!(det.handle(&repeat(SPACE)), Decision::Swallow);
        assert_eq!(det.handle(&down(KEY_A)), Decision::Swallow);
        assert_eq!(det.handle(&up(KEY_A)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::PostHold);

        assert_eq!(det.handle(&up(SPACE)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::Idle);
    }

    #[test]
    fn test_counter_blocks_capture_during_chord() {
        let (mut det, _rx) = detector();

        // Another key is already down: the designated key passes through.
        assert_eq!(det.handle(&down(KEY_A)), Decision::Forward);
        assert_eq!(det.handle(&down(SPACE)), Decision::Forward);
        assert_eq!(det.state(), HoldState::Idle);

        assert_eq!(det.handle(&up(SPACE)), Decision::Forward);
        assert_eq!(det.handle(&up(KEY_A)), Decision::Forward);

        // Alone again, capture works.
        assert_eq!(det.handle(&down(SPACE)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::AwaitingHold);
    }

    #[test]
    fn test_counter_clamps_at_zero() {
        let (mut det, _rx) = detector();

        // An unmatched key-up (its down was consumed while the tap was
        // disabled) must not drive the counter negative.
        assert_eq!(det.handle(&up(KEY_B)), Decision::Forward);
        assert_eq!(det.handle(&up(KEY_B)), Decision::Forward);
        assert_eq!(det.held_keys, 0);

        assert_eq!(det.handle(&down(SPACE)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::AwaitingHold);
    }

    #[test]
    fn test_unrelated_key_up_swallowed_while_awaiting() {
        let (mut det, _rx) = detector();

        det.handle(&down(SPACE));
        let armed = det.scheduler.armed.unwrap();

        // Release of a key that was down before the tap saw anything.
        assert_eq!(det.handle(&up(KEY_B)), Decision::Swallow);
        assert_eq!(det.state(), HoldState::AwaitingHold);
        assert_eq!(det.scheduler.armed, Some(armed));
    }

    #[test]
    fn test_stale_timeout_is_noop() {
        let (mut det, mut rx) = detector();

        det.handle(&down(SPACE));
        let armed = det.scheduler.armed.unwrap();
        det.handle(&up(SPACE));
        assert_eq!(det.state(), HoldState::Idle);

        // The canceled timer's firing was already queued: delivering it
        // now must not corrupt anything.
        det.on_hold_timeout(armed);
        assert_eq!(det.state(), HoldState::Idle);
        assert!(det.pending_timer.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_tap_interrupted_resets_capture() {
        let (mut det, mut rx) = detector();

        det.handle(&down(SPACE));
        let armed = det.scheduler.armed.unwrap();

        det.on_tap_interrupted();
        assert_eq!(det.state(), HoldState::Idle);
        assert!(det.scheduler.canceled.contains(&armed));
        assert!(det.pending_down.is_none());
        assert!(matches!(rx.try_recv(), Ok(DetectorEvent::TapInterrupted)));

        // The stale firing after the reset is still a no-op.
        det.on_hold_timeout(armed);
        assert_eq!(det.state(), HoldState::Idle);
    }

    #[test]
    fn test_tap_interrupted_ends_active_hold() {
        let (mut det, mut rx) = detector();

        det.handle(&down(SPACE));
        fire_timeout(&mut det);
        assert!(matches!(rx.try_recv(), Ok(DetectorEvent::KeyHeld { .. })));

        det.on_tap_interrupted();
        assert_eq!(det.state(), HoldState::Idle);
        assert!(matches!(rx.try_recv(), Ok(DetectorEvent::HoldEnded { .. })));
        assert!(matches!(rx.try_recv(), Ok(DetectorEvent::TapInterrupted)));
    }

    #[test]
    fn test_repeat_down_ignored_in_idle() {
        let (mut det, _rx) = detector();

        // A repeat without a preceding non-repeat down (the down predates
        // the tap) never starts a capture.
        assert_eq!(det.handle(&repeat(SPACE)), Decision::Forward);
        assert_eq!(det.state(), HoldState::Idle);
    }
}
