//! Event dispatch: admission, indicator updates, and the broadcast itself.

use embedded_hal_async::delay::DelayNs;
use heapless::Vec;

use crate::config::MAX_PAYLOAD;
use crate::indicator::{IndicatorController, IndicatorState, Pixel};
use crate::registry::{ConnectionRegistry, Underflow};

/// An opaque payload as written by a client.
pub type Payload = Vec<u8, MAX_PAYLOAD>;

/// Discrete events delivered by the radio layer, one at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RelayEvent {
    ClientConnected,
    ClientDisconnected,
    DataReceived(Payload),
}

/// Running totals for diagnosis. Underflows indicate duplicate disconnects
/// upstream and are never expected in normal operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RelayStats {
    pub relayed: u32,
    pub underflows: u32,
}

/// Radio-side capabilities the relay needs: broadcasting a payload to every
/// attached client, and re-arming discoverability after the platform's
/// single-shot advertising stops on a connect.
#[allow(async_fn_in_trait)]
pub trait Radio {
    async fn notify_all(&mut self, payload: &[u8]);
    fn start_advertising(&mut self);
}

/// The relay state machine. Owns the registry and the indicator as one unit;
/// the caller must feed it events run-to-completion, never concurrently.
pub struct RelayCore<R, P, D> {
    registry: ConnectionRegistry,
    indicator: IndicatorController<P, D>,
    radio: R,
    stats: RelayStats,
}

impl<R: Radio, P: Pixel, D: DelayNs> RelayCore<R, P, D> {
    pub fn new(
        registry: ConnectionRegistry,
        indicator: IndicatorController<P, D>,
        radio: R,
    ) -> Self {
        Self {
            registry,
            indicator,
            radio,
            stats: RelayStats::default(),
        }
    }

    /// Boot entry: show the resting color and become discoverable.
    pub async fn start(&mut self) {
        self.indicator.set(self.rest_state()).await;
        self.radio.start_advertising();
    }

    pub fn client_count(&self) -> u32 {
        self.registry.current_count()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    fn rest_state(&self) -> IndicatorState {
        if self.registry.is_empty() {
            IndicatorState::Empty
        } else {
            IndicatorState::Occupied
        }
    }

    /// Apply one event. Returns `Err(Underflow)` when a disconnect fired with
    /// no client attached; the count is already clamped and the node keeps
    /// running, but the caller should report it.
    pub async fn handle(&mut self, event: RelayEvent) -> Result<(), Underflow> {
        match event {
            RelayEvent::ClientConnected => {
                self.registry.on_connected();
                self.indicator.set(IndicatorState::Occupied).await;
                // Advertising stopped when this link came up; keep shouting
                // while slots remain so more clients can join.
                if self.registry.try_admit() {
                    self.radio.start_advertising();
                }
                Ok(())
            }
            RelayEvent::ClientDisconnected => {
                let result = self.registry.on_disconnected();
                if result.is_err() {
                    self.stats.underflows += 1;
                }
                self.indicator.set(self.rest_state()).await;
                // A slot freed (or the node went idle); always discoverable.
                self.radio.start_advertising();
                result
            }
            RelayEvent::DataReceived(payload) => {
                if payload.is_empty() {
                    return Ok(());
                }
                self.radio.notify_all(&payload).await;
                self.stats.relayed += 1;
                self.indicator.flash_and_restore(self.rest_state()).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::{RGB_BLU, RGB_GRN, RGB_RED};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct TestPixel {
        writes: Rc<RefCell<std::vec::Vec<(u8, u8, u8)>>>,
    }

    impl Pixel for TestPixel {
        async fn set_color(&mut self, r: u8, g: u8, b: u8) {
            self.writes.borrow_mut().push((r, g, b));
        }
    }

    #[derive(Clone, Default)]
    struct TestRadio {
        notified: Rc<RefCell<std::vec::Vec<std::vec::Vec<u8>>>>,
        adv_arms: Rc<Cell<u32>>,
    }

    impl Radio for TestRadio {
        async fn notify_all(&mut self, payload: &[u8]) {
            self.notified.borrow_mut().push(payload.to_vec());
        }

        fn start_advertising(&mut self) {
            self.adv_arms.set(self.adv_arms.get() + 1);
        }
    }

    struct InstantDelay;

    impl DelayNs for InstantDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    struct Harness {
        core: RelayCore<TestRadio, TestPixel, InstantDelay>,
        writes: Rc<RefCell<std::vec::Vec<(u8, u8, u8)>>>,
        notified: Rc<RefCell<std::vec::Vec<std::vec::Vec<u8>>>>,
        adv_arms: Rc<Cell<u32>>,
    }

    fn harness(max_clients: u32) -> Harness {
        let pixel = TestPixel::default();
        let radio = TestRadio::default();
        let writes = pixel.writes.clone();
        let notified = radio.notified.clone();
        let adv_arms = radio.adv_arms.clone();
        let core = RelayCore::new(
            ConnectionRegistry::new(max_clients),
            IndicatorController::new(pixel, InstantDelay, 15),
            radio,
        );
        Harness {
            core,
            writes,
            notified,
            adv_arms,
        }
    }

    fn payload(bytes: &[u8]) -> Payload {
        Payload::from_slice(bytes).unwrap()
    }

    #[test]
    fn boot_shows_red_and_advertises() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.start());
        assert_eq!(*h.writes.borrow(), vec![RGB_RED]);
        assert_eq!(h.adv_arms.get(), 1);
    }

    #[test]
    fn connect_shows_green_and_rearms_while_capacity_remains() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        assert_eq!(h.core.client_count(), 1);
        assert_eq!(*h.writes.borrow(), vec![RGB_GRN]);
        assert_eq!(h.adv_arms.get(), 1);
    }

    #[test]
    fn saturating_connect_does_not_rearm() {
        let mut h = harness(2);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        assert_eq!(h.adv_arms.get(), 1);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        // Saturated: no second re-arm.
        assert_eq!(h.adv_arms.get(), 1);
        assert_eq!(h.core.client_count(), 2);
    }

    #[test]
    fn disconnect_always_rearms_and_picks_rest_color() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        h.writes.borrow_mut().clear();
        let arms_before = h.adv_arms.get();

        embassy_futures::block_on(h.core.handle(RelayEvent::ClientDisconnected)).unwrap();
        assert_eq!(*h.writes.borrow(), vec![RGB_GRN]);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientDisconnected)).unwrap();
        assert_eq!(*h.writes.borrow(), vec![RGB_GRN, RGB_RED]);
        assert_eq!(h.adv_arms.get(), arms_before + 2);
    }

    #[test]
    fn data_broadcasts_once_and_flashes() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        h.writes.borrow_mut().clear();

        embassy_futures::block_on(h.core.handle(RelayEvent::DataReceived(payload(b"ping"))))
            .unwrap();
        assert_eq!(*h.notified.borrow(), vec![b"ping".to_vec()]);
        assert_eq!(*h.writes.borrow(), vec![RGB_BLU, RGB_GRN]);
        assert_eq!(h.core.stats().relayed, 1);
    }

    #[test]
    fn data_with_no_clients_rests_red() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.start());
        h.writes.borrow_mut().clear();

        embassy_futures::block_on(h.core.handle(RelayEvent::DataReceived(payload(b"ghost"))))
            .unwrap();
        assert_eq!(*h.writes.borrow(), vec![RGB_BLU, RGB_RED]);
    }

    #[test]
    fn empty_payload_is_a_noop() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        h.writes.borrow_mut().clear();

        embassy_futures::block_on(h.core.handle(RelayEvent::DataReceived(Payload::new())))
            .unwrap();
        assert!(h.notified.borrow().is_empty());
        assert!(h.writes.borrow().is_empty());
        assert_eq!(h.core.stats().relayed, 0);
    }

    #[test]
    fn payloads_relayed_exactly_once_in_write_order() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        for bytes in [&b"one"[..], b"two", b"three"] {
            embassy_futures::block_on(h.core.handle(RelayEvent::DataReceived(payload(bytes))))
                .unwrap();
        }
        assert_eq!(
            *h.notified.borrow(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(h.core.stats().relayed, 3);
    }

    #[test]
    fn underflow_is_reported_and_clamped() {
        let mut h = harness(4);
        assert_eq!(
            embassy_futures::block_on(h.core.handle(RelayEvent::ClientDisconnected)),
            Err(Underflow)
        );
        assert_eq!(h.core.client_count(), 0);
        assert_eq!(h.core.stats().underflows, 1);
        // The node keeps going: indicator rests red, discoverability armed.
        assert_eq!(*h.writes.borrow(), vec![RGB_RED]);
        assert!(h.adv_arms.get() >= 1);
    }

    #[test]
    fn full_session_scenario() {
        let mut h = harness(4);
        embassy_futures::block_on(h.core.start());
        assert_eq!(*h.writes.borrow(), vec![RGB_RED]);
        assert_eq!(h.adv_arms.get(), 1);

        // Four clients join; advertising re-arms after each except the last.
        for _ in 0..4 {
            embassy_futures::block_on(h.core.handle(RelayEvent::ClientConnected)).unwrap();
        }
        assert_eq!(h.core.client_count(), 4);
        assert_eq!(h.adv_arms.get(), 4);
        assert_eq!(
            *h.writes.borrow(),
            vec![RGB_RED, RGB_GRN, RGB_GRN, RGB_GRN, RGB_GRN]
        );

        // A relayed payload flashes blue and returns to green.
        h.writes.borrow_mut().clear();
        embassy_futures::block_on(h.core.handle(RelayEvent::DataReceived(payload(b"ping"))))
            .unwrap();
        assert_eq!(*h.notified.borrow(), vec![b"ping".to_vec()]);
        assert_eq!(*h.writes.borrow(), vec![RGB_BLU, RGB_GRN]);

        // Everyone leaves; each departure re-arms, final color is red.
        h.writes.borrow_mut().clear();
        for _ in 0..4 {
            embassy_futures::block_on(h.core.handle(RelayEvent::ClientDisconnected)).unwrap();
        }
        assert_eq!(h.core.client_count(), 0);
        assert_eq!(h.adv_arms.get(), 8);
        assert_eq!(
            *h.writes.borrow(),
            vec![RGB_GRN, RGB_GRN, RGB_GRN, RGB_RED]
        );
    }
}
