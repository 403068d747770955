//! Cost domain types
//!
//! Raw provider lines come out of collectors, pass through the
//! [`Normalizer`](normalizer::Normalizer) and end up as [`CostRecord`]s keyed by
//! `(provider, service, date)`.

pub mod normalizer;
pub mod range;

pub use normalizer::{CurrencyConverter, Normalizer, UsdOnly};
pub use range::{parse_date, DateRange, DateRangeResolver, RangeMode};

use crate::error::{Error, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Billing source
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Gcp, Provider::Azure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        }
    }

    /// Parse a comma separated provider list such as `aws,gcp`.
    ///
    /// Blank entries are ignored; an empty result is an error.
    pub fn parse_list(input: &str) -> Result<BTreeSet<Provider>> {
        let providers = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Provider::from_str)
            .collect::<Result<BTreeSet<_>>>()?;

        if providers.is_empty() {
            return Err(Error::ConfigError("provider list is empty".to_string()));
        }
        Ok(providers)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "gcp" => Ok(Provider::Gcp),
            "azure" => Ok(Provider::Azure),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// One line as reported by a provider, before normalization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawCostLine {
    pub provider: Provider,
    /// Native service identifier
    pub service: String,
    /// Optional sub-identifier, e.g. Azure's "Service Resource"
    pub resource: Option<String>,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
}

impl RawCostLine {
    pub fn usd(provider: Provider, service: impl Into<String>, date: NaiveDate, amount: Decimal) -> Self {
        Self {
            provider,
            service: service.into(),
            resource: None,
            date,
            amount,
            currency: "USD".to_string(),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Canonical cost row: unique per `(provider, service, date)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRecord {
    pub provider: Provider,
    pub service: String,
    pub date: NaiveDate,
    /// USD, 4 decimal places
    pub cost: Decimal,
    pub currency: String,
}

impl CostRecord {
    pub fn key(&self) -> CostKey {
        CostKey {
            provider: self.provider,
            service: self.service.clone(),
            date: self.date,
        }
    }
}

/// Identity of a stored cost row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CostKey {
    pub provider: Provider,
    pub service: String,
    pub date: NaiveDate,
}
