// A `None` channel means the driver could not produce a trustworthy sample
// this cycle; downstream consumers skip it rather than act on garbage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReading {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub voc: Option<f32>,
    pub lux: Option<f32>,
    pub battery: Option<f32>,
}

impl SensorReading {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.voc.is_none()
            && self.lux.is_none()
            && self.battery.is_none()
    }
}

// Capability-set seam: the alarm and publish paths consume one uniform
// reading regardless of which physical sensors are fitted.
pub trait SensorSource {
    fn sample(&mut self) -> SensorReading;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reading_is_empty() {
        assert!(SensorReading::default().is_empty());
        assert!(!SensorReading {
            lux: Some(88.0),
            ..SensorReading::default()
        }
        .is_empty());
    }
}
