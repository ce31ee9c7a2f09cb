//! ---
//! morse_section: "03-signal-rendering"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Encoding table, pulse timing and indicator playback."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::time::Duration;

use morse_common::config::TimingConfig;

use crate::indicator::IndicatorState;
use crate::{Result, SignalError};

/// Element of a signal code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// `.`
    Dot,
    /// `-`
    Dash,
    /// ` `, the extra off-time that turns an element gap into a letter gap.
    Gap,
}

impl Symbol {
    /// Parse one code character.
    pub fn parse(ch: char) -> Option<Self> {
        match ch {
            '.' => Some(Symbol::Dot),
            '-' => Some(Symbol::Dash),
            ' ' => Some(Symbol::Gap),
            _ => None,
        }
    }
}

/// Durations derived from a single base unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTiming {
    unit: Duration,
}

impl PulseTiming {
    /// Timing with an explicit base unit.
    pub fn new(unit: Duration) -> Result<Self> {
        if unit.is_zero() {
            return Err(SignalError::InvalidUnit);
        }
        Ok(Self { unit })
    }

    /// PARIS timing: one unit is 1.2 s divided by the speed.
    pub fn from_wpm(wpm: u32) -> Result<Self> {
        if wpm == 0 {
            return Err(SignalError::InvalidWpm(wpm));
        }
        Self::new(TimingConfig::unit_for_wpm(wpm))
    }

    /// Timing described by the `[timing]` configuration section.
    pub fn from_config(config: &TimingConfig) -> Result<Self> {
        Self::new(config.effective_unit())
    }

    /// Base unit.
    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// On-time of a dot.
    pub fn dot(&self) -> Duration {
        self.unit
    }

    /// On-time of a dash.
    pub fn dash(&self) -> Duration {
        self.unit * 3
    }

    /// Off-time following every element.
    pub fn intra_gap(&self) -> Duration {
        self.unit
    }

    /// Off-time between letters.
    pub fn inter_letter_gap(&self) -> Duration {
        self.unit * 3
    }

    /// Off-time between words.
    pub fn word_gap(&self) -> Duration {
        self.unit * 7
    }

    /// Lay `code` out as alternating on/off pulses.
    ///
    /// Adjacent off-times are merged. Off-time before the first element and
    /// after the last one is dropped, so the plan starts on the rising edge of
    /// the first pulse and ends on the falling edge of the final one.
    pub fn plan(&self, code: &str) -> Plan {
        let mut plan = Plan::default();
        for (position, ch) in code.chars().enumerate() {
            let Some(symbol) = Symbol::parse(ch) else {
                plan.skipped.push((position, ch));
                continue;
            };
            match symbol {
                Symbol::Dot => {
                    plan.push(IndicatorState::On, self.dot(), position);
                    plan.push(IndicatorState::Off, self.intra_gap(), position);
                }
                Symbol::Dash => {
                    plan.push(IndicatorState::On, self.dash(), position);
                    plan.push(IndicatorState::Off, self.intra_gap(), position);
                }
                Symbol::Gap => {
                    plan.push(
                        IndicatorState::Off,
                        self.inter_letter_gap() - self.intra_gap(),
                        position,
                    );
                }
            }
        }
        while plan
            .pulses
            .last()
            .is_some_and(|pulse| pulse.state == IndicatorState::Off)
        {
            plan.pulses.pop();
        }
        plan
    }
}

/// One timed indicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// State held for `duration`.
    pub state: IndicatorState,
    /// How long the state is held.
    pub duration: Duration,
    /// Index of the code character that started the pulse.
    pub position: usize,
}

/// Timed rendering of a code string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Pulses in playback order, alternating on and off.
    pub pulses: Vec<Pulse>,
    /// Characters that are not code symbols, with their index.
    pub skipped: Vec<(usize, char)>,
}

impl Plan {
    fn push(&mut self, state: IndicatorState, duration: Duration, position: usize) {
        if let Some(last) = self.pulses.last_mut() {
            if last.state == state && state == IndicatorState::Off {
                last.duration += duration;
                return;
            }
        }
        if state == IndicatorState::Off && self.pulses.is_empty() {
            // Leading gaps have nothing to separate.
            return;
        }
        self.pulses.push(Pulse {
            state,
            duration,
            position,
        });
    }

    /// Time from the first rising edge to the last falling edge.
    pub fn total_duration(&self) -> Duration {
        self.pulses.iter().map(|pulse| pulse.duration).sum()
    }

    /// Whether nothing would be keyed.
    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> PulseTiming {
        PulseTiming::new(Duration::from_millis(100)).expect("valid unit")
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn durations_are_exact_multiples_of_the_unit() {
        let timing = timing();
        assert_eq!(timing.dot(), ms(100));
        assert_eq!(timing.dash(), ms(300));
        assert_eq!(timing.intra_gap(), ms(100));
        assert_eq!(timing.inter_letter_gap(), ms(300));
        assert_eq!(timing.word_gap(), ms(700));
    }

    #[test]
    fn paris_speed_sets_the_unit() {
        assert_eq!(PulseTiming::from_wpm(20).unwrap().unit(), ms(60));
        let config = TimingConfig {
            wpm: Some(7),
            ..TimingConfig::default()
        };
        assert_eq!(
            PulseTiming::from_config(&config).unwrap(),
            PulseTiming::from_wpm(7).unwrap()
        );
        assert_eq!(
            PulseTiming::from_wpm(7).unwrap().unit(),
            Duration::from_micros(171_428)
        );
        assert!(matches!(
            PulseTiming::from_wpm(0),
            Err(SignalError::InvalidWpm(0))
        ));
        assert!(matches!(
            PulseTiming::new(Duration::ZERO),
            Err(SignalError::InvalidUnit)
        ));
    }

    #[test]
    fn distress_call_lasts_twenty_seven_units() {
        let plan = timing().plan("... --- ...");
        assert_eq!(plan.total_duration(), ms(2700));
        assert_eq!(
            plan.pulses.iter().filter(|p| p.state == IndicatorState::On).count(),
            9
        );
        assert_eq!(plan.pulses.first().map(|p| p.state), Some(IndicatorState::On));
        assert_eq!(plan.pulses.last().map(|p| p.state), Some(IndicatorState::On));
    }

    #[test]
    fn gaps_follow_the_one_three_seven_ratio() {
        let plan = timing().plan(". .   .");
        let offs: Vec<Duration> = plan
            .pulses
            .iter()
            .filter(|p| p.state == IndicatorState::Off)
            .map(|p| p.duration)
            .collect();
        assert_eq!(offs, vec![ms(300), ms(700)]);
    }

    #[test]
    fn unknown_symbols_are_skipped() {
        let plan = timing().plan(".x-");
        assert_eq!(plan.skipped, vec![(1, 'x')]);
        let ons: Vec<Duration> = plan
            .pulses
            .iter()
            .filter(|p| p.state == IndicatorState::On)
            .map(|p| p.duration)
            .collect();
        assert_eq!(ons, vec![ms(100), ms(300)]);
        assert_eq!(plan.pulses[2].position, 2);
    }

    #[test]
    fn blank_codes_produce_no_pulses() {
        assert!(timing().plan("").is_empty());
        assert!(timing().plan("   ").is_empty());
    }

    #[test]
    fn leading_gaps_are_not_keyed() {
        let padded = timing().plan("  .");
        assert_eq!(padded.total_duration(), ms(100));
        assert_eq!(padded.pulses[0].state, IndicatorState::On);
        assert_eq!(padded.pulses[0].position, 2);
    }
}
