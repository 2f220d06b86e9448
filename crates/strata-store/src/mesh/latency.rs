//! Simulated delivery delay.

use std::time::Duration;

use rand::Rng;

/// How long a message spends in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyModel {
    /// Every message takes exactly this long
    Fixed(Duration),
    /// `floor` plus a uniform random extra of up to `jitter`
    Jittered { floor: Duration, jitter: Duration },
}

impl LatencyModel {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            LatencyModel::Fixed(delay) => delay,
            LatencyModel::Jittered { floor, jitter } => {
                let max = u64::try_from(jitter.as_micros()).unwrap_or(u64::MAX);
                floor + Duration::from_micros(rng.gen_range(0..=max))
            }
        }
    }

    /// Smallest delay this model can produce.
    pub fn floor(&self) -> Duration {
        match *self {
            LatencyModel::Fixed(delay) => delay,
            LatencyModel::Jittered { floor, .. } => floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn fixed_is_fixed() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = LatencyModel::Fixed(Duration::from_millis(100));
        assert_eq!(model.sample(&mut rng), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_above_floor() {
        let mut rng = StdRng::seed_from_u64(7);
        let model = LatencyModel::Jittered {
            floor: Duration::from_millis(20),
            jitter: Duration::from_millis(80),
        };
        for _ in 0..200 {
            let d = model.sample(&mut rng);
            assert!(d >= Duration::from_millis(20) && d <= Duration::from_millis(100), "{d:?}");
        }
        assert_eq!(model.floor(), Duration::from_millis(20));
    }
}
