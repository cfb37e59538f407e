//! Product records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::ParseEnumError;

/// Lifecycle status of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    /// Actively developed.
    Active,
    /// On hold; tasks may still reference it.
    Paused,
    /// Shut down. New tasks may not target a killed product.
    Killed,
}

impl ProductStatus {
    /// Returns the wire string for this value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "killed" => Ok(Self::Killed),
            other => Err(ParseEnumError {
                kind: "product status",
                value: other.to_string(),
            }),
        }
    }
}

/// Risk posture of a product, used by reporting and alert routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Low blast radius.
    Low,
    /// Default.
    Normal,
    /// Elevated scrutiny.
    High,
}

impl RiskLevel {
    /// Returns the wire string for this value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(ParseEnumError {
                kind: "risk level",
                value: other.to_string(),
            }),
        }
    }
}

/// One product line governed by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Unique short slug.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: ProductStatus,
    /// Risk posture.
    pub risk_level: RiskLevel,
    /// Creation timestamp; preserved across upserts.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}
