/// Weighted running mean of a scalar metric.
#[derive(Clone, Debug, Default)]
pub struct RunningAverage {
    weighted_sum: f64,
    total_weight: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.weighted_sum += value * weight;
        self.total_weight += weight;
    }

    /// `Σ(vᵢ·wᵢ) / Σwᵢ`, or `None` before any weight has been added.
    pub fn value(&self) -> Option<f64> {
        if self.total_weight > 0.0 {
            Some(self.weighted_sum / self.total_weight)
        } else {
            None
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-epoch accumulators tracked by the trainer.
#[derive(Clone, Debug, Default)]
pub struct EpochMeters {
    pub triplet_loss: RunningAverage,
    pub iteration_time: RunningAverage,
    pub image_domain_loss: RunningAverage,
    pub sketch_domain_loss: RunningAverage,
}

impl EpochMeters {
    pub fn reset(&mut self) {
        self.triplet_loss.reset();
        self.iteration_time.reset();
        self.image_domain_loss.reset();
        self.sketch_domain_loss.reset();
    }
}
