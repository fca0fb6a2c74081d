use rust_decimal::{prelude::ToPrimitive, Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use std::io;

use super::Watts;
use crate::Error;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterNumeric {
    U16,
    U32,

    #[serde(alias = "s16")]
    I16,
    #[default]
    #[serde(alias = "s32")]
    I32,
}

impl RegisterNumeric {
    /// Number of 16-bit registers the value spans
    pub fn size(&self) -> u16 {
        use RegisterNumeric::*;
        match self {
            U16 | I16 => 1,
            U32 | I32 => 2,
        }
    }

    fn type_name(&self) -> String {
        format!("{:?}", *self).to_lowercase()
    }

    /// Smallest and largest values a read can produce
    fn range(&self) -> [i64; 2] {
        use RegisterNumeric::*;
        match self {
            U16 => [0, i64::from(u16::MAX)],
            U32 => [0, i64::from(u32::MAX)],
            I16 => [i64::from(i16::MIN), i64::from(i16::MAX)],
            I32 => [i64::from(i32::MIN), i64::from(i32::MAX)],
        }
    }

    /// Decode big-endian words, or `None` when the device reports its "no value" marker (all bits set for unsigned
    /// types, only the sign bit for signed ones).
    fn decode(&self, words: &[u16]) -> Option<i64> {
        use RegisterNumeric::*;
        let wide = || (u32::from(words[0]) << 16) | u32::from(words[1]);
        match self {
            U16 => (words[0] != u16::MAX).then(|| i64::from(words[0])),
            I16 => {
                let value = words[0] as i16;
                (value != i16::MIN).then(|| i64::from(value))
            }
            U32 => {
                let value = wide();
                (value != u32::MAX).then(|| i64::from(value))
            }
            I32 => {
                let value = wide() as i32;
                (value != i32::MIN).then(|| i64::from(value))
            }
        }
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    #[serde(alias = "hold")]
    Holding,
    Input,
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Swap(pub bool);

/// Location and encoding of the inverter's instantaneous AC power
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRegister {
    #[serde(default = "default_power_address")]
    pub address: u16,

    #[serde(rename = "type", default)]
    pub of: RegisterNumeric,

    #[serde(default)]
    pub kind: RegisterKind,

    #[serde(default)]
    pub swap_words: Swap,

    /// Powers of 10 (0 = no adjustment, 1 = x10, -1 = /10)
    #[serde(default)]
    pub scale: i8,
}

impl Default for PowerRegister {
    fn default() -> Self {
        Self {
            address: default_power_address(),
            of: Default::default(),
            kind: Default::default(),
            swap_words: Default::default(),
            scale: 0,
        }
    }
}

/// SMA Sunny Boy total AC active power
fn default_power_address() -> u16 {
    30775
}

impl PowerRegister {
    pub fn size(&self) -> u16 {
        self.of.size()
    }

    pub fn type_name(&self) -> String {
        self.of.type_name()
    }

    pub fn apply_swaps(&self, words: &[u16]) -> Vec<u16> {
        if self.swap_words.0 {
            words
                .chunks_exact(2)
                .flat_map(|chunk| [chunk[1], chunk[0]])
                .collect()
        } else {
            words.into()
        }
    }

    /// Check that `scale` works for every value the register could hold, so a bad scale is caught at startup rather
    /// than on the first read.
    pub fn validate(&self) -> crate::Result<()> {
        for raw in self.of.range() {
            self.adjust(raw)?;
        }
        Ok(())
    }

    /// Turn the raw register words into whole watts.
    ///
    /// The "no value" marker, which inverters report while not producing, reads as zero.
    pub fn parse_words(&self, words: &[u16]) -> crate::Result<Watts> {
        if words.len() != usize::from(self.size()) {
            return Err(Error::Connectivity(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expected {} registers for {}, got {}",
                    self.size(),
                    self.type_name(),
                    words.len()
                ),
            )));
        }

        let words = self.apply_swaps(words);
        match self.of.decode(&words) {
            Some(raw) => self.adjust(raw),
            None => Ok(0),
        }
    }

    fn adjust(&self, raw: i64) -> crate::Result<Watts> {
        if self.scale == 0 {
            return Ok(raw);
        }

        Decimal::TEN
            .checked_powi(self.scale.into())
            .and_then(|scale| scale.checked_mul(Decimal::from(raw)))
            .and_then(|watts| watts.round().to_i64())
            .ok_or_else(|| {
                Error::config(format!(
                    "scaling {raw} by 10^{} overflows",
                    self.scale
                ))
            })
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_empty_power_register_defaults() {
    use serde_json::json;
    let register = serde_json::from_value::<PowerRegister>(json!({})).unwrap();
    assert_eq!(register, PowerRegister::default());
    assert_eq!(register.address, 30775);
    assert_eq!(register.of, RegisterNumeric::I32);
    assert_eq!(register.kind, RegisterKind::Holding);
    assert_eq!(register.size(), 2);
}

#[test]
fn parse_power_register_aliases() {
    use serde_json::json;
    let register = serde_json::from_value::<PowerRegister>(json!({
        "address": 5030,
        "type": "s16",
        "kind": "input",
        "swap_words": true,
        "scale": 1
    }))
    .unwrap();

    assert!(matches!(
        register,
        PowerRegister {
            address: 5030,
            of: RegisterNumeric::I16,
            kind: RegisterKind::Input,
            swap_words: Swap(true),
            scale: 1,
        }
    ));
}

#[test]
fn decode_signed_32_bit_power() {
    let register = PowerRegister::default();
    assert_eq!(register.parse_words(&[0, 2880]).unwrap(), 2880);
    assert_eq!(register.parse_words(&[1, 0]).unwrap(), 65536);
    assert_eq!(register.parse_words(&[0xFFFF, 0xFF9C]).unwrap(), -100);
}

#[test]
fn decode_no_value_marker_as_zero() {
    assert_eq!(
        PowerRegister::default()
            .parse_words(&[0x8000, 0x0000])
            .unwrap(),
        0
    );

    let register = PowerRegister {
        of: RegisterNumeric::U16,
        ..Default::default()
    };
    assert_eq!(register.parse_words(&[0xFFFF]).unwrap(), 0);
    assert_eq!(register.parse_words(&[1234]).unwrap(), 1234);
}

#[test]
fn decode_swapped_words() {
    let register = PowerRegister {
        of: RegisterNumeric::U32,
        swap_words: Swap(true),
        ..Default::default()
    };
    assert_eq!(register.parse_words(&[2880, 0]).unwrap(), 2880);
}

#[test]
fn decode_scaled_power() {
    let kilowatts_tenths = PowerRegister {
        of: RegisterNumeric::U16,
        scale: 2,
        ..Default::default()
    };
    assert_eq!(kilowatts_tenths.parse_words(&[29]).unwrap(), 2900);

    let deciwatts = PowerRegister {
        of: RegisterNumeric::U16,
        scale: -1,
        ..Default::default()
    };
    assert_eq!(deciwatts.parse_words(&[28806]).unwrap(), 2881);
}

#[test]
fn validate_rejects_overflowing_scale() {
    assert!(PowerRegister::default().validate().is_ok());

    let kilowatts = PowerRegister {
        scale: 3,
        ..Default::default()
    };
    assert!(kilowatts.validate().is_ok());

    for (of, scale) in [
        (RegisterNumeric::I32, 127),
        (RegisterNumeric::U32, 19),
        (RegisterNumeric::I16, 15),
    ] {
        let register = PowerRegister {
            of,
            scale,
            ..Default::default()
        };
        assert!(
            matches!(register.validate(), Err(Error::InvalidConfig(_))),
            "{of:?} scaled by 10^{scale} accepted"
        );
    }
}

#[test]
fn decode_wrong_length_is_connectivity_error() {
    let result = PowerRegister::default().parse_words(&[42]);
    assert!(result.unwrap_err().is_connectivity());
}
