//! Player catalog: profiles partitioned by gender, stored as JSON.

use crate::stats::{Attribute, STAT_MAX, STAT_MIN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate {gender} player id {id}")]
    DuplicateId { gender: Gender, id: u32 },
    #[error("player {id} ({gender}): {attribute} = {value} is outside [1, 99]")]
    StatOutOfRange {
        gender: Gender,
        id: u32,
        attribute: Attribute,
        value: u8,
    },
}

/// Catalog partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Male, Gender::Female];

    /// Parse an optional caller tag; empty, `"unknown"` and `"unset"` mean
    /// no partition preference.
    pub fn parse_tag(tag: &str) -> Result<Option<Gender>, String> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "unknown" | "unset" | "any" => Ok(None),
            other => other.parse().map(Some),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Gender::Male => "male",
            Gender::Female => "female",
        })
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            other => Err(format!("unknown gender tag: {other}")),
        }
    }
}

/// One catalog entry. `id` is unique within its gender partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub id: u32,
    pub name: String,
    pub position: String,
    pub base_stats: BTreeMap<Attribute, u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub club: Option<String>,
}

/// Base stats given to entries appended without explicit stats.
pub fn default_base_stats() -> BTreeMap<Attribute, u8> {
    [
        (Attribute::Pac, 80),
        (Attribute::Sho, 80),
        (Attribute::Pas, 80),
        (Attribute::Dri, 80),
        (Attribute::Def, 50),
        (Attribute::Phy, 75),
    ]
    .into_iter()
    .collect()
}

/// On-disk catalog layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub male_players: Vec<PlayerProfile>,
    #[serde(default)]
    pub female_players: Vec<PlayerProfile>,
}

impl Catalog {
    /// Load and validate a JSON catalog file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&text)?;
        tracing::info!(
            path = %path.display(),
            male = catalog.male_players.len(),
            female = catalog.female_players.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check id uniqueness per partition and the stat range.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for gender in Gender::ALL {
            let mut seen = HashSet::new();
            for p in self.partition(gender) {
                if !seen.insert(p.id) {
                    return Err(CatalogError::DuplicateId { gender, id: p.id });
                }
                if let Some((&attribute, &value)) = p
                    .base_stats
                    .iter()
                    .find(|(_, &v)| !(STAT_MIN..=STAT_MAX).contains(&v))
                {
                    return Err(CatalogError::StatOutOfRange {
                        gender,
                        id: p.id,
                        attribute,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn partition(&self, gender: Gender) -> &[PlayerProfile] {
        match gender {
            Gender::Male => &self.male_players,
            Gender::Female => &self.female_players,
        }
    }

    fn partition_mut(&mut self, gender: Gender) -> &mut Vec<PlayerProfile> {
        match gender {
            Gender::Male => &mut self.male_players,
            Gender::Female => &mut self.female_players,
        }
    }

    /// Next free id in a partition: one past the current maximum.
    pub fn next_id(&self, gender: Gender) -> u32 {
        self.partition(gender).iter().map(|p| p.id).max().map_or(1, |max| max + 1)
    }

    /// Append a new profile with a fresh id and return a copy of it.
    pub fn append(
        &mut self,
        gender: Gender,
        name: &str,
        position: &str,
        base_stats: BTreeMap<Attribute, u8>,
    ) -> Result<PlayerProfile, CatalogError> {
        let profile = PlayerProfile {
            id: self.next_id(gender),
            name: name.to_string(),
            position: position.to_string(),
            base_stats,
            country: None,
            club: None,
        };
        self.partition_mut(gender).push(profile.clone());
        if let Err(e) = self.validate() {
            self.partition_mut(gender).pop();
            return Err(e);
        }
        Ok(profile)
    }

    /// Write the catalog as pretty JSON via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
