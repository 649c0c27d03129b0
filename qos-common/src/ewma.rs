/// Exponentially weighted moving average.
///
/// `alpha` is the weight of a new sample. Before the first sample the filter is unseeded and
/// [`Ewma::update`] adopts the sample as-is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha: alpha.clamp(0.0, 1.0), value: None }
    }

    /// Builds a filter for samples taken every `sample_interval` with the given time constant,
    /// i.e. `alpha = T / (tau + T)`.
    pub fn with_time_constant(sample_interval_ms: f64, time_constant_ms: f64) -> Self {
        let alpha = if sample_interval_ms + time_constant_ms > 0.0 {
            sample_interval_ms / (time_constant_ms + sample_interval_ms)
        } else {
            1.0
        };
        Self::new(alpha)
    }

    /// Starts the filter from a known value.
    pub fn seeded(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(current) => current + (sample - current) * self.alpha,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn value_or_zero(&self) -> f64 {
        self.value.unwrap_or_default()
    }

    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}
