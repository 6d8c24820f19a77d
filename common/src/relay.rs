use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Light,
    Vmc,
    Heater,
    Ac,
}

impl Actuator {
    pub const ALL: [Actuator; 4] = [Self::Light, Self::Vmc, Self::Heater, Self::Ac];

    pub fn attribute_key(self) -> &'static str {
        match self {
            Self::Light => "LIGHT_RELAY",
            Self::Vmc => "VMC_RELAY",
            Self::Heater => "HEATER_RELAY",
            Self::Ac => "AC_RELAY",
        }
    }

    pub fn set_method(self) -> &'static str {
        match self {
            Self::Light => "set_light_switch",
            Self::Vmc => "set_vmc_switch",
            Self::Heater => "set_heater_switch",
            Self::Ac => "set_ac_switch",
        }
    }

    pub fn get_method(self) -> &'static str {
        match self {
            Self::Light => "get_light_switch",
            Self::Vmc => "get_vmc_switch",
            Self::Heater => "get_heater_switch",
            Self::Ac => "get_ac_switch",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Light => 0,
            Self::Vmc => 1,
            Self::Heater => 2,
            Self::Ac => 3,
        }
    }
}

pub trait RelayDriver {
    fn write(&mut self, actuator: Actuator, level: bool) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct RelayBank {
    state: [bool; Actuator::ALL.len()],
}

impl RelayBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, actuator: Actuator) -> bool {
        self.state[actuator.index()]
    }

    pub fn states(&self) -> impl Iterator<Item = (Actuator, bool)> + '_ {
        Actuator::ALL
            .into_iter()
            .map(move |actuator| (actuator, self.state(actuator)))
    }

    // The only mutation path: output first, then the mirror, so the mirror
    // never disagrees with the last level actually driven.
    pub fn apply<D: RelayDriver>(
        &mut self,
        actuator: Actuator,
        desired: bool,
        driver: &mut D,
    ) -> anyhow::Result<bool> {
        driver.write(actuator, desired)?;
        self.state[actuator.index()] = desired;
        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingDriver {
        writes: Vec<(Actuator, bool)>,
        fail: bool,
    }

    impl RelayDriver for RecordingDriver {
        fn write(&mut self, actuator: Actuator, level: bool) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("relay line unavailable");
            }
            self.writes.push((actuator, level));
            Ok(())
        }
    }

    #[test]
    fn mirror_tracks_driven_level() {
        let mut bank = RelayBank::new();
        let mut driver = RecordingDriver::default();

        assert!(!bank.state(Actuator::Heater));
        let applied = bank.apply(Actuator::Heater, true, &mut driver).unwrap();

        assert!(applied);
        assert!(bank.state(Actuator::Heater));
        assert_eq!(driver.writes, vec![(Actuator::Heater, true)]);
    }

    #[test]
    fn apply_is_idempotent() {
        let mut bank = RelayBank::new();
        let mut driver = RecordingDriver::default();

        bank.apply(Actuator::Light, true, &mut driver).unwrap();
        bank.apply(Actuator::Light, true, &mut driver).unwrap();

        assert!(bank.state(Actuator::Light));
        // Both writes reach the output; the observable state is unchanged.
        assert_eq!(
            driver.writes,
            vec![(Actuator::Light, true), (Actuator::Light, true)]
        );
    }

    #[test]
    fn failed_write_leaves_mirror_untouched() {
        let mut bank = RelayBank::new();
        let mut driver = RecordingDriver {
            fail: true,
            ..RecordingDriver::default()
        };

        assert!(bank.apply(Actuator::Ac, true, &mut driver).is_err());
        assert!(!bank.state(Actuator::Ac));
    }

    #[test]
    fn all_actuators_start_off() {
        let bank = RelayBank::new();
        for (_, state) in bank.states() {
            assert!(!state);
        }
    }
}
