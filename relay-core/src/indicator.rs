//! Indicator state to pixel color mapping.

use embedded_hal_async::delay::DelayNs;

/// Semantic state of the visual indicator. Derived on each event, never
/// stored; the displayed color is always a function of the current count and
/// the event being handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IndicatorState {
    /// No clients attached.
    Empty,
    /// At least one client attached, no activity.
    Occupied,
    /// Transient flash while a payload is being relayed.
    Activity,
}

pub const RGB_RED: (u8, u8, u8) = (255, 0, 0);
pub const RGB_GRN: (u8, u8, u8) = (0, 255, 0);
pub const RGB_BLU: (u8, u8, u8) = (0, 0, 255);

/// Color for a given indicator state. Pure; repeated identical states always
/// yield the same command.
pub fn color_for(state: IndicatorState) -> (u8, u8, u8) {
    match state {
        IndicatorState::Empty => RGB_RED,
        IndicatorState::Occupied => RGB_GRN,
        IndicatorState::Activity => RGB_BLU,
    }
}

/// Anything that can display a single RGB color. Assumed infallible at this
/// layer; driver faults are logged and swallowed below it.
#[allow(async_fn_in_trait)]
pub trait Pixel {
    async fn set_color(&mut self, r: u8, g: u8, b: u8);
}

/// Maps indicator states onto the pixel collaborator.
pub struct IndicatorController<P, D> {
    pixel: P,
    delay: D,
    flash_ms: u32,
}

impl<P: Pixel, D: DelayNs> IndicatorController<P, D> {
    pub fn new(pixel: P, delay: D, flash_ms: u32) -> Self {
        Self {
            pixel,
            delay,
            flash_ms,
        }
    }

    /// Issue the single color command for `state`.
    pub async fn set(&mut self, state: IndicatorState) {
        let (r, g, b) = color_for(state);
        self.pixel.set_color(r, g, b).await;
    }

    /// Show the activity flash, dwell, then return to `rest`.
    ///
    /// The dwell is the only suspension point in the core. It is not
    /// cancellable: once the flash starts it always completes and restores.
    pub async fn flash_and_restore(&mut self, rest: IndicatorState) {
        self.set(IndicatorState::Activity).await;
        self.delay.delay_ms(self.flash_ms).await;
        self.set(rest).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone, Default)]
    struct TestPixel {
        writes: Rc<RefCell<Vec<(u8, u8, u8)>>>,
    }

    impl Pixel for TestPixel {
        async fn set_color(&mut self, r: u8, g: u8, b: u8) {
            self.writes.borrow_mut().push((r, g, b));
        }
    }

    struct InstantDelay;

    impl DelayNs for InstantDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn state_to_color_is_fixed() {
        assert_eq!(color_for(IndicatorState::Empty), RGB_RED);
        assert_eq!(color_for(IndicatorState::Occupied), RGB_GRN);
        assert_eq!(color_for(IndicatorState::Activity), RGB_BLU);
        // Idempotent: same state, same command.
        assert_eq!(
            color_for(IndicatorState::Occupied),
            color_for(IndicatorState::Occupied)
        );
    }

    #[test]
    fn set_issues_one_command() {
        let pixel = TestPixel::default();
        let writes = pixel.writes.clone();
        let mut indicator = IndicatorController::new(pixel, InstantDelay, 15);

        embassy_futures::block_on(indicator.set(IndicatorState::Empty));
        embassy_futures::block_on(indicator.set(IndicatorState::Empty));
        assert_eq!(*writes.borrow(), vec![RGB_RED, RGB_RED]);
    }

    #[test]
    fn flash_shows_activity_then_rest() {
        let pixel = TestPixel::default();
        let writes = pixel.writes.clone();
        let mut indicator = IndicatorController::new(pixel, InstantDelay, 15);

        embassy_futures::block_on(indicator.flash_and_restore(IndicatorState::Occupied));
        assert_eq!(*writes.borrow(), vec![RGB_BLU, RGB_GRN]);

        writes.borrow_mut().clear();
        embassy_futures::block_on(indicator.flash_and_restore(IndicatorState::Empty));
        assert_eq!(*writes.borrow(), vec![RGB_BLU, RGB_RED]);
    }
}
