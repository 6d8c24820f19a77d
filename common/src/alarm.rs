use crate::{config::AlarmThresholds, sensors::SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    TempHigh,
    TempLow,
    HumidityHigh,
    HumidityLow,
    VocHigh,
    LuxLow,
    BatteryLow,
}

impl Quantity {
    pub const ALL: [Quantity; 7] = [
        Self::TempHigh,
        Self::TempLow,
        Self::HumidityHigh,
        Self::HumidityLow,
        Self::VocHigh,
        Self::LuxLow,
        Self::BatteryLow,
    ];

    pub fn direction(self) -> Direction {
        match self {
            Self::TempHigh | Self::HumidityHigh | Self::VocHigh => Direction::Above,
            Self::TempLow | Self::HumidityLow | Self::LuxLow | Self::BatteryLow => {
                Direction::Below
            }
        }
    }

    pub fn telemetry_key(self) -> &'static str {
        match self {
            Self::TempHigh => "temp_alarm_high",
            Self::TempLow => "temp_alarm_low",
            Self::HumidityHigh => "humidity_alarm_high",
            Self::HumidityLow => "humidity_alarm_low",
            Self::VocHigh => "voc_alarm",
            Self::LuxLow => "lux_alarm",
            Self::BatteryLow => "battery_alarm",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::TempHigh => 0,
            Self::TempLow => 1,
            Self::HumidityHigh => 2,
            Self::HumidityLow => 3,
            Self::VocHigh => 4,
            Self::LuxLow => 5,
            Self::BatteryLow => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmEvent {
    pub quantity: Quantity,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct AlarmEngine {
    thresholds: AlarmThresholds,
    active: [bool; Quantity::ALL.len()],
}

impl AlarmEngine {
    pub fn new(mut thresholds: AlarmThresholds) -> Self {
        thresholds.sanitize();
        Self {
            thresholds,
            active: [false; Quantity::ALL.len()],
        }
    }

    pub fn thresholds(&self) -> &AlarmThresholds {
        &self.thresholds
    }

    pub fn is_active(&self, quantity: Quantity) -> bool {
        self.active[quantity.index()]
    }

    pub fn evaluate(&mut self, quantity: Quantity, sample: f32) -> Option<AlarmEvent> {
        let threshold = self.thresholds.threshold(quantity);
        // Strict comparisons: a sample exactly on the threshold never alarms.
        let violated = match quantity.direction() {
            Direction::Above => sample > threshold,
            Direction::Below => sample < threshold,
        };

        let flag = &mut self.active[quantity.index()];
        match (violated, *flag) {
            (true, false) => {
                *flag = true;
                Some(AlarmEvent {
                    quantity,
                    active: true,
                })
            }
            (false, true) => {
                *flag = false;
                Some(AlarmEvent {
                    quantity,
                    active: false,
                })
            }
            _ => None,
        }
    }

    pub fn evaluate_reading(&mut self, reading: &SensorReading) -> Vec<AlarmEvent> {
        let channels = [
            (Quantity::TempHigh, reading.temperature),
            (Quantity::TempLow, reading.temperature),
            (Quantity::HumidityHigh, reading.humidity),
            (Quantity::HumidityLow, reading.humidity),
            (Quantity::VocHigh, reading.voc),
            (Quantity::BatteryLow, reading.battery),
            // Lux is published as telemetry only; no low-light alarm here.
        ];

        channels
            .into_iter()
            .filter_map(|(quantity, sample)| {
                let sample = sample.filter(|sample| sample.is_finite())?;
                self.evaluate(quantity, sample)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine() -> AlarmEngine {
        AlarmEngine::new(AlarmThresholds::default())
    }

    #[test]
    fn raises_once_while_condition_persists() {
        let mut engine = engine();

        assert_eq!(engine.evaluate(Quantity::TempHigh, 18.0), None);
        assert_eq!(
            engine.evaluate(Quantity::TempHigh, 21.5),
            Some(AlarmEvent {
                quantity: Quantity::TempHigh,
                active: true,
            })
        );
        assert_eq!(engine.evaluate(Quantity::TempHigh, 24.0), None);
        assert_eq!(engine.evaluate(Quantity::TempHigh, 21.5), None);
        assert!(engine.is_active(Quantity::TempHigh));
    }

    #[test]
    fn clears_once_when_condition_resolves() {
        let mut engine = engine();

        engine.evaluate(Quantity::TempHigh, 25.0);
        assert_eq!(
            engine.evaluate(Quantity::TempHigh, 19.0),
            Some(AlarmEvent {
                quantity: Quantity::TempHigh,
                active: false,
            })
        );
        assert_eq!(engine.evaluate(Quantity::TempHigh, 18.0), None);
        assert!(!engine.is_active(Quantity::TempHigh));
    }

    #[test]
    fn threshold_equality_never_alarms() {
        let mut engine = engine();

        assert_eq!(engine.evaluate(Quantity::TempHigh, 20.0), None);
        assert_eq!(engine.evaluate(Quantity::TempLow, 0.0), None);
        assert_eq!(engine.evaluate(Quantity::BatteryLow, 3.3), None);
        assert!(!engine.is_active(Quantity::TempHigh));
        assert!(!engine.is_active(Quantity::TempLow));
        assert!(!engine.is_active(Quantity::BatteryLow));
    }

    #[test]
    fn raised_and_cleared_counts_match_crossings() {
        let mut engine = engine();
        let samples = [19.0, 22.0, 23.0, 18.0, 25.0, 25.0, 14.0, 21.0, 19.9];

        let events: Vec<AlarmEvent> = samples
            .iter()
            .filter_map(|sample| engine.evaluate(Quantity::TempHigh, *sample))
            .collect();

        let raised = events.iter().filter(|event| event.active).count();
        let cleared = events.iter().filter(|event| !event.active).count();
        assert_eq!(raised, 3);
        assert_eq!(cleared, 3);

        // Raised and cleared strictly alternate for a single quantity.
        for pair in events.windows(2) {
            assert_ne!(pair[0].active, pair[1].active);
        }
    }

    #[test]
    fn battery_scenario_end_to_end() {
        let mut engine = engine();

        assert_eq!(engine.evaluate(Quantity::BatteryLow, 3.5), None);
        assert_eq!(
            engine.evaluate(Quantity::BatteryLow, 3.2),
            Some(AlarmEvent {
                quantity: Quantity::BatteryLow,
                active: true,
            })
        );
        for _ in 0..3 {
            assert_eq!(engine.evaluate(Quantity::BatteryLow, 3.1), None);
        }
        assert_eq!(
            engine.evaluate(Quantity::BatteryLow, 3.4),
            Some(AlarmEvent {
                quantity: Quantity::BatteryLow,
                active: false,
            })
        );
    }

    #[test]
    fn humidity_alarms_evaluate_in_both_directions() {
        let mut engine = engine();

        let reading = SensorReading {
            humidity: Some(82.0),
            ..SensorReading::default()
        };
        let events = engine.evaluate_reading(&reading);
        assert_eq!(
            events,
            vec![AlarmEvent {
                quantity: Quantity::HumidityHigh,
                active: true,
            }]
        );

        let reading = SensorReading {
            humidity: Some(12.0),
            ..SensorReading::default()
        };
        let events = engine.evaluate_reading(&reading);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&AlarmEvent {
            quantity: Quantity::HumidityHigh,
            active: false,
        }));
        assert!(events.contains(&AlarmEvent {
            quantity: Quantity::HumidityLow,
            active: true,
        }));
    }

    #[test]
    fn missing_channels_are_not_evaluated() {
        let mut engine = engine();

        engine.evaluate(Quantity::TempHigh, 25.0);
        assert!(engine.is_active(Quantity::TempHigh));

        // A failed temperature read must not clear (or re-raise) the alarm.
        let reading = SensorReading {
            battery: Some(3.9),
            ..SensorReading::default()
        };
        assert_eq!(engine.evaluate_reading(&reading), vec![]);
        assert!(engine.is_active(Quantity::TempHigh));
    }

    #[test]
    fn lux_channel_is_inert_in_reading_evaluation() {
        let mut engine = engine();

        let reading = SensorReading {
            lux: Some(5.0),
            ..SensorReading::default()
        };
        assert_eq!(engine.evaluate_reading(&reading), vec![]);
        assert!(!engine.is_active(Quantity::LuxLow));

        // Direct evaluation still works for callers that want it.
        assert!(engine.evaluate(Quantity::LuxLow, 5.0).is_some());
    }

    #[test]
    fn non_finite_samples_are_skipped() {
        let mut engine = engine();

        let reading = SensorReading {
            temperature: Some(f32::NAN),
            voc: Some(f32::INFINITY),
            ..SensorReading::default()
        };
        assert_eq!(engine.evaluate_reading(&reading), vec![]);
    }
}
