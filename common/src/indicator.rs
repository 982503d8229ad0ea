/// Output driven by the indicator. `true` is the "on" level regardless of wiring polarity.
pub trait IndicatorPin {
    fn set_level(&mut self, on: bool);
}

pub struct Indicator<P> {
    pin: P,
    period_ms: u64,
    on: bool,
    last_toggle_ms: u64,
}

impl<P: IndicatorPin> Indicator<P> {
    pub fn new(mut pin: P, period_ms: u64, now_ms: u64) -> Self {
        pin.set_level(false);
        Self {
            pin,
            period_ms,
            on: false,
            last_toggle_ms: now_ms,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn last_toggle_ms(&self) -> u64 {
        self.last_toggle_ms
    }

    /// Flips the output once `period_ms` has elapsed since the previous flip.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_toggle_ms) < self.period_ms {
            return false;
        }
        self.last_toggle_ms = now_ms;
        self.on = !self.on;
        self.pin.set_level(self.on);
        true
    }

    /// Sets the level from an inbound command. The toggle timer is left alone.
    pub fn force(&mut self, on: bool) {
        self.on = on;
        self.pin.set_level(on);
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }
}
