//! Pulse numbers and pulse data.
//!
//! A pulse is the unit of logical time. Each pulse carries the distance to
//! its neighbours, so the range of pulse numbers that belong to one pulse is
//! `pulse_number..next_pulse_number`.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConveyorError, Result};

/// A time pulse number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PulseNumber(u32);

impl PulseNumber {
    /// The first time pulse.
    pub const MIN: PulseNumber = PulseNumber(65537);

    /// The last time pulse.
    pub const MAX: PulseNumber = PulseNumber(0x3FFF_FFFF);

    pub fn new(value: u32) -> Result<Self> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(PulseNumber(value))
        } else {
            Err(ConveyorError::InvalidPulse { value })
        }
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// `self + delta`, if still a time pulse.
    pub fn checked_add(self, delta: u16) -> Option<PulseNumber> {
        self.0
            .checked_add(u32::from(delta))
            .and_then(|v| PulseNumber::new(v).ok())
    }

    /// `self - delta`, if still a time pulse.
    pub fn checked_sub(self, delta: u16) -> Option<PulseNumber> {
        self.0
            .checked_sub(u32::from(delta))
            .and_then(|v| PulseNumber::new(v).ok())
    }
}

impl TryFrom<u32> for PulseNumber {
    type Error = ConveyorError;

    fn try_from(value: u32) -> Result<Self> {
        PulseNumber::new(value)
    }
}

impl From<PulseNumber> for u32 {
    fn from(pn: PulseNumber) -> u32 {
        pn.0
    }
}

impl fmt::Display for PulseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256 bits of pulse entropy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Entropy(pub [u8; 32]);

impl Entropy {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        Entropy(bytes)
    }
}

impl fmt::Debug for Entropy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entropy({self})")
    }
}

impl fmt::Display for Entropy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Data of one pulse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseData {
    pub pulse_number: PulseNumber,
    /// Distance to the previous pulse; zero for the first pulse.
    pub prev_delta: u16,
    /// Distance to the next pulse.
    pub next_delta: u16,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub entropy: Entropy,
}

impl PulseData {
    /// The first pulse of a chain.
    pub fn new_first(delta: u16, entropy: Entropy) -> Self {
        PulseData {
            pulse_number: PulseNumber::MIN,
            prev_delta: 0,
            next_delta: delta,
            timestamp: Utc::now().timestamp(),
            entropy,
        }
    }

    /// The pulse that follows this one.
    pub fn create_next(&self, delta: u16, entropy: Entropy) -> Result<PulseData> {
        let pulse_number = self.next_pulse_number().ok_or(ConveyorError::NoNextPulse {
            pulse: self.pulse_number,
        })?;
        Ok(PulseData {
            pulse_number,
            prev_delta: self.next_delta,
            next_delta: delta,
            timestamp: Utc::now().timestamp(),
            entropy,
        })
    }

    pub fn next_pulse_number(&self) -> Option<PulseNumber> {
        if self.next_delta == 0 {
            return None;
        }
        self.pulse_number.checked_add(self.next_delta)
    }

    pub fn prev_pulse_number(&self) -> Option<PulseNumber> {
        if self.prev_delta == 0 {
            return None;
        }
        self.pulse_number.checked_sub(self.prev_delta)
    }

    /// True when `pn` lies in this pulse's range.
    pub fn contains(&self, pn: PulseNumber) -> bool {
        pn >= self.pulse_number && self.next_pulse_number().map_or(true, |next| pn < next)
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Check the pulse can be committed.
    pub fn validate(&self) -> Result<()> {
        if self.next_delta == 0 {
            return Err(ConveyorError::NoNextPulse {
                pulse: self.pulse_number,
            });
        }
        Ok(())
    }
}

/// An endless chain of pulses with a fixed delta and random entropy.
///
/// Ends only when the pulse number space is exhausted.
#[derive(Debug, Clone)]
pub struct PulseGenerator {
    delta: u16,
    last: Option<PulseData>,
}

impl PulseGenerator {
    pub fn new(delta: u16) -> Result<Self> {
        if delta == 0 {
            return Err(ConveyorError::NoNextPulse {
                pulse: PulseNumber::MIN,
            });
        }
        Ok(Self { delta, last: None })
    }

    /// Continue the chain after `last`.
    pub fn resume(last: PulseData, delta: u16) -> Result<Self> {
        let mut generator = Self::new(delta)?;
        generator.last = Some(last);
        Ok(generator)
    }
}

impl Iterator for PulseGenerator {
    type Item = PulseData;

    fn next(&mut self) -> Option<PulseData> {
        let next = match &self.last {
            None => PulseData::new_first(self.delta, Entropy::random()),
            Some(last) => last.create_next(self.delta, Entropy::random()).ok()?,
        };
        self.last = Some(next.clone());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_number_range() {
        assert!(PulseNumber::new(65536).is_err());
        assert_eq!(PulseNumber::new(65537).unwrap(), PulseNumber::MIN);
        assert!(PulseNumber::new(0x4000_0000).is_err());
        assert_eq!(PulseNumber::MIN.checked_sub(1), None);
        assert_eq!(PulseNumber::MAX.checked_add(1), None);
        assert_eq!(PulseNumber::MIN.checked_add(10).unwrap().as_u32(), 65547);
    }

    #[test]
    fn pulse_number_deserialize_is_checked() {
        let pn: PulseNumber = serde_json::from_str("65540").unwrap();
        assert_eq!(pn.as_u32(), 65540);
        assert!(serde_json::from_str::<PulseNumber>("7").is_err());
    }

    #[test]
    fn chain_links_neighbours() {
        let first = PulseData::new_first(10, Entropy::default());
        assert_eq!(first.prev_pulse_number(), None);
        let second = first.create_next(20, Entropy::random()).unwrap();

        assert_eq!(Some(second.pulse_number), first.next_pulse_number());
        assert_eq!(second.prev_pulse_number(), Some(first.pulse_number));
        assert_eq!(second.next_pulse_number().unwrap().as_u32(), 65537 + 30);
        assert!(first.contains(PulseNumber::new(65546).unwrap()));
        assert!(!first.contains(second.pulse_number));
        assert!(first.time().is_some());
    }

    #[test]
    fn zero_delta_has_no_next() {
        let last = PulseData::new_first(0, Entropy::default());
        assert!(last.validate().is_err());
        assert!(matches!(
            last.create_next(10, Entropy::default()),
            Err(ConveyorError::NoNextPulse { .. })
        ));
    }

    #[test]
    fn generator_is_monotonic() {
        let pulses: Vec<_> = PulseGenerator::new(10).unwrap().take(5).collect();
        assert_eq!(pulses[0].pulse_number, PulseNumber::MIN);
        for pair in pulses.windows(2) {
            assert_eq!(Some(pair[1].pulse_number), pair[0].next_pulse_number());
        }
        assert!(PulseGenerator::new(0).is_err());
    }

    #[test]
    fn pulse_data_roundtrips_through_json() {
        let pd = PulseData::new_first(10, Entropy::random());
        let text = serde_json::to_string(&pd).unwrap();
        let back: PulseData = serde_json::from_str(&text).unwrap();
        assert_eq!(back, pd);
    }
}
