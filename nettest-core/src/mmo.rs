//! Modified moving average
//!
//! `avg += (sample - avg) / K`. Behaves like a K-sample boxcar average but
//! needs only one value of state.

/// Modified moving average with a fixed averaging window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mmo {
    window: u32,
    value: f64,
    primed: bool,
}

impl Mmo {
    /// Create an average over `window` samples (a window of 0 is treated as 1)
    pub fn new(window: u32) -> Self {
        Mmo {
            window: window.max(1),
            value: 0.0,
            primed: false,
        }
    }

    /// Feed one sample
    ///
    /// The first sample seeds the average directly.
    #[inline]
    pub fn update(&mut self, sample: f64) {
        if self.primed {
            self.value += (sample - self.value) / f64::from(self.window);
        } else {
            self.value = sample;
            self.primed = true;
        }
    }

    /// Current average (0.0 before the first sample)
    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Averaging window size
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.value = 0.0;
        self.primed = false;
    }
}
