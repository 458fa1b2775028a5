use rand::Rng;

/// Simulated per-channel energy accumulators. The real meter integrates
/// current-sensor readings; here we just accrue random watt-hours so the
/// reset command has something visible to zero.
#[derive(Debug)]
pub struct Meter {
    energy_wh: Vec<f64>,
}

impl Meter {
    pub fn new(channels: usize) -> Self {
        Self {
            energy_wh: vec![0.0; channels],
        }
    }

    pub fn accumulate(&mut self) {
        let mut rng = rand::thread_rng();
        for channel in &mut self.energy_wh {
            *channel += rng.gen_range(0.5..15.0);
        }
    }

    pub fn reset(&mut self) {
        for channel in &mut self.energy_wh {
            *channel = 0.0;
        }
    }

    pub fn total_wh(&self) -> f64 {
        self.energy_wh.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_zeroes_all_channels() {
        let mut meter = Meter::new(3);
        meter.accumulate();
        assert!(meter.total_wh() > 0.0);

        meter.reset();
        assert_eq!(meter.total_wh(), 0.0);
    }
}
