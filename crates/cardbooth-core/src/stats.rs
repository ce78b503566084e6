//! Player attributes, stat derivation and the overall rating.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const STAT_MIN: u8 = 1;
pub const STAT_MAX: u8 = 99;

/// Largest per-attribute random adjustment, applied symmetrically.
pub const MAX_DELTA: i32 = 3;

/// Attribute codes used by outfield and goalkeeper cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Attribute {
    Pac,
    Sho,
    Pas,
    Dri,
    Def,
    Phy,
    Div,
    Han,
    Kic,
    Ref,
    Spd,
    Pos,
}

impl Attribute {
    pub const ALL: [Attribute; 12] = [
        Attribute::Pac,
        Attribute::Sho,
        Attribute::Pas,
        Attribute::Dri,
        Attribute::Def,
        Attribute::Phy,
        Attribute::Div,
        Attribute::Han,
        Attribute::Kic,
        Attribute::Ref,
        Attribute::Spd,
        Attribute::Pos,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Attribute::Pac => "PAC",
            Attribute::Sho => "SHO",
            Attribute::Pas => "PAS",
            Attribute::Dri => "DRI",
            Attribute::Def => "DEF",
            Attribute::Phy => "PHY",
            Attribute::Div => "DIV",
            Attribute::Han => "HAN",
            Attribute::Kic => "KIC",
            Attribute::Ref => "REF",
            Attribute::Spd => "SPD",
            Attribute::Pos => "POS",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Attribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        Attribute::ALL
            .into_iter()
            .find(|a| a.code() == code)
            .ok_or_else(|| format!("unknown attribute code: {s}"))
    }
}

/// Which weight table and card layout a stat block uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Outfield,
    Goalkeeper,
}

impl Variant {
    /// Goalkeeper blocks are recognised by the diving attribute.
    pub fn detect(stats: &BTreeMap<Attribute, u8>) -> Self {
        if stats.contains_key(&Attribute::Div) {
            Variant::Goalkeeper
        } else {
            Variant::Outfield
        }
    }

    /// Card slot order; goalkeeper attributes occupy the outfield slots.
    pub fn slots(self) -> [Attribute; 6] {
        match self {
            Variant::Outfield => [
                Attribute::Pac,
                Attribute::Sho,
                Attribute::Pas,
                Attribute::Dri,
                Attribute::Def,
                Attribute::Phy,
            ],
            Variant::Goalkeeper => [
                Attribute::Div,
                Attribute::Han,
                Attribute::Kic,
                Attribute::Ref,
                Attribute::Spd,
                Attribute::Pos,
            ],
        }
    }

    /// Weights in whole percent; each table sums to 100.
    pub fn weights(self) -> [(Attribute, u32); 6] {
        match self {
            Variant::Outfield => [
                (Attribute::Pac, 10),
                (Attribute::Sho, 20),
                (Attribute::Pas, 15),
                (Attribute::Dri, 20),
                (Attribute::Def, 15),
                (Attribute::Phy, 20),
            ],
            Variant::Goalkeeper => [
                (Attribute::Div, 20),
                (Attribute::Han, 20),
                (Attribute::Kic, 15),
                (Attribute::Ref, 20),
                (Attribute::Spd, 5),
                (Attribute::Pos, 20),
            ],
        }
    }
}

/// Weighted overall rating, rounded half-to-even and clamped to [1, 99].
///
/// Computed in exact integer hundredths so .5 boundaries are never
/// perturbed by float error. Attributes missing from `stats` weigh 0.
pub fn overall_rating(stats: &BTreeMap<Attribute, u8>, variant: Variant) -> u8 {
    let hundredths: u32 = variant
        .weights()
        .iter()
        .map(|(attr, w)| stats.get(attr).copied().unwrap_or(0) as u32 * w)
        .sum();

    let (whole, rem) = (hundredths / 100, hundredths % 100);
    let rounded = if rem > 50 || (rem == 50 && whole % 2 == 1) {
        whole + 1
    } else {
        whole
    };
    rounded.clamp(STAT_MIN as u32, STAT_MAX as u32) as u8
}

/// A derived, immutable set of card stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatBlock {
    values: BTreeMap<Attribute, u8>,
    overall: u8,
    variant: Variant,
}

impl StatBlock {
    /// Clamp every value into range and compute the overall rating.
    pub fn new(values: BTreeMap<Attribute, u8>) -> Self {
        let values: BTreeMap<Attribute, u8> = values
            .into_iter()
            .map(|(attr, v)| (attr, v.clamp(STAT_MIN, STAT_MAX)))
            .collect();
        let variant = Variant::detect(&values);
        let overall = overall_rating(&values, variant);
        Self { values, overall, variant }
    }

    pub fn get(&self, attr: Attribute) -> Option<u8> {
        self.values.get(&attr).copied()
    }

    pub fn overall(&self) -> u8 {
        self.overall
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn values(&self) -> &BTreeMap<Attribute, u8> {
        &self.values
    }

    /// The six card slots as `(attribute, value)`; missing values read 0.
    pub fn slots(&self) -> [(Attribute, u8); 6] {
        self.variant
            .slots()
            .map(|attr| (attr, self.get(attr).unwrap_or(0)))
    }
}

/// Apply `delta(attr)` (limited to ±[`MAX_DELTA`]) to each base value and
/// clamp to [1, 99].
pub fn derive_stats_with<F>(base: &BTreeMap<Attribute, u8>, mut delta: F) -> StatBlock
where
    F: FnMut(Attribute) -> i32,
{
    let derived = base
        .iter()
        .map(|(&attr, &value)| {
            let d = delta(attr).clamp(-MAX_DELTA, MAX_DELTA);
            let v = (value as i32 + d).clamp(STAT_MIN as i32, STAT_MAX as i32);
            (attr, v as u8)
        })
        .collect();
    StatBlock::new(derived)
}

/// Derive a stat block with an independent uniform delta in ±3 per attribute.
pub fn derive_stats<R: Rng>(base: &BTreeMap<Attribute, u8>, rng: &mut R) -> StatBlock {
    derive_stats_with(base, |_| rng.gen_range(-MAX_DELTA..=MAX_DELTA))
}
