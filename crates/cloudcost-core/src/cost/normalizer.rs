//! Service name canonicalization and amount normalization

use super::{CostRecord, Provider, RawCostLine};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

/// Decimal places kept for stored amounts
pub const COST_SCALE: u32 = 4;

/// Name used when a provider reports an empty service identifier
pub const UNKNOWN_SERVICE: &str = "Unknown";

/// Converts an amount in some currency into USD
pub trait CurrencyConverter: Send + Sync {
    /// Returns `None` when no rate is known for `currency`
    fn to_usd(&self, amount: Decimal, currency: &str) -> Option<Decimal>;
}

/// Identity conversion for USD, no rates for anything else
#[derive(Debug, Default, Clone, Copy)]
pub struct UsdOnly;

impl CurrencyConverter for UsdOnly {
    fn to_usd(&self, amount: Decimal, currency: &str) -> Option<Decimal> {
        currency.eq_ignore_ascii_case("USD").then_some(amount)
    }
}

/// Ordered Azure rules; first match wins
const AZURE_RULES: &[(&[&str], &str)] = &[
    (&["gpt", "chatgpt", "davinci", "embedding", "ada"], "Azure OpenAI"),
    (&["speech to text", "stt"], "Azure Speech-to-Text"),
    (&["text to speech", "tts", "neural"], "Azure Text-to-Speech"),
];

/// Maps raw provider lines onto canonical [`CostRecord`]s
pub struct Normalizer {
    converter: Box<dyn CurrencyConverter>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Box::new(UsdOnly))
    }
}

impl Normalizer {
    pub fn new(converter: Box<dyn CurrencyConverter>) -> Self {
        Self { converter }
    }

    pub fn normalize(&self, raw: &RawCostLine) -> CostRecord {
        CostRecord {
            provider: raw.provider,
            service: canonical_service(raw.provider, &raw.service, raw.resource.as_deref()),
            date: raw.date,
            cost: self.usd_amount(raw),
            currency: "USD".to_string(),
        }
    }

    fn usd_amount(&self, raw: &RawCostLine) -> Decimal {
        let amount = match self.converter.to_usd(raw.amount, &raw.currency) {
            Some(usd) => usd,
            None => {
                warn!(
                    provider = %raw.provider,
                    service = %raw.service,
                    currency = %raw.currency,
                    "No conversion rate, storing amount unconverted"
                );
                raw.amount
            }
        };
        round_cost(amount)
    }
}

/// Round to 4 decimal places, ties away from zero
pub fn round_cost(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Canonical service name for a provider identifier.
///
/// Azure resources collapse into model/speech families; AWS and GCP names pass
/// through unchanged.
pub fn canonical_service(provider: Provider, service: &str, resource: Option<&str>) -> String {
    let service = service.trim();

    if provider == Provider::Azure {
        let probe = resource
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(service)
            .to_lowercase();

        for (needles, canonical) in AZURE_RULES {
            if needles.iter().any(|n| probe.contains(n)) {
                return (*canonical).to_string();
            }
        }
    }

    if service.is_empty() {
        UNKNOWN_SERVICE.to_string()
    } else {
        service.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn azure(service: &str, resource: &str) -> String {
        canonical_service(Provider::Azure, service, Some(resource))
    }

    #[test]
    fn test_azure_openai_family() {
        assert_eq!(azure("Cognitive Services", "gpt-4o-0806-Inp-glbl Tokens"), "Azure OpenAI");
        assert_eq!(azure("Cognitive Services", "text-embedding-3-small"), "Azure OpenAI");
        assert_eq!(azure("Cognitive Services", "Davinci Tokens"), "Azure OpenAI");
    }

    #[test]
    fn test_azure_speech_families() {
        assert_eq!(azure("Cognitive Services", "S1 Speech To Text"), "Azure Speech-to-Text");
        assert_eq!(azure("Cognitive Services", "STT Batch"), "Azure Speech-to-Text");
        assert_eq!(azure("Cognitive Services", "S1 Text To Speech"), "Azure Text-to-Speech");
        assert_eq!(azure("Cognitive Services", "Neural Voice Characters"), "Azure Text-to-Speech");
    }

    #[test]
    fn test_azure_rule_order_first_match_wins() {
        // contains both "ada" and "tts"; the OpenAI rule comes first
        assert_eq!(azure("Cognitive Services", "ada tts bundle"), "Azure OpenAI");
    }

    #[test]
    fn test_azure_without_resource_probes_service() {
        assert_eq!(
            canonical_service(Provider::Azure, "Speech To Text", None),
            "Azure Speech-to-Text"
        );
        assert_eq!(canonical_service(Provider::Azure, "Storage", None), "Storage");
        assert_eq!(canonical_service(Provider::Azure, "Storage", Some("  ")), "Storage");
    }

    #[test]
    fn test_azure_no_match_keeps_service_name() {
        assert_eq!(azure("Virtual Machines", "D2s v3"), "Virtual Machines");
    }

    #[test]
    fn test_aws_and_gcp_pass_through() {
        // would match the Azure rules, but only Azure is canonicalized
        assert_eq!(canonical_service(Provider::Aws, "Amazon Neural Thing", None), "Amazon Neural Thing");
        assert_eq!(canonical_service(Provider::Gcp, "Vertex AI gpt", None), "Vertex AI gpt");
    }

    #[test]
    fn test_empty_identifier_is_unknown() {
        assert_eq!(canonical_service(Provider::Gcp, "", None), "Unknown");
        assert_eq!(canonical_service(Provider::Azure, " ", Some("")), "Unknown");
    }

    #[test]
    fn test_rounding_midpoint_away_from_zero() {
        assert_eq!(round_cost(dec!(1.23455)), dec!(1.2346));
        assert_eq!(round_cost(dec!(1.23445)), dec!(1.2345));
        assert_eq!(round_cost(dec!(0.00004)), dec!(0.0000));
        assert_eq!(round_cost(dec!(-2.00005)), dec!(-2.0001));
    }

    #[test]
    fn test_normalize_usd_line() {
        let raw = RawCostLine::usd(Provider::Azure, "Cognitive Services", day(), dec!(820.604999))
            .with_resource("gpt-4o Tokens");
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.service, "Azure OpenAI");
        assert_eq!(record.cost, dec!(820.6050));
        assert_eq!(record.currency, "USD");
        assert_eq!(record.date, day());
    }

    struct FixedRate;

    impl CurrencyConverter for FixedRate {
        fn to_usd(&self, amount: Decimal, currency: &str) -> Option<Decimal> {
            match currency {
                "USD" => Some(amount),
                "EUR" => Some(amount * dec!(1.1)),
                _ => None,
            }
        }
    }

    #[test]
    fn test_normalize_converts_currency() {
        let mut raw = RawCostLine::usd(Provider::Gcp, "BigQuery", day(), dec!(10));
        raw.currency = "EUR".to_string();
        let record = Normalizer::new(Box::new(FixedRate)).normalize(&raw);
        assert_eq!(record.cost, dec!(11.0));
        assert_eq!(record.currency, "USD");
    }

    #[test]
    fn test_normalize_unknown_currency_passes_amount_through() {
        let mut raw = RawCostLine::usd(Provider::Gcp, "BigQuery", day(), dec!(3.14159));
        raw.currency = "JPY".to_string();
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.cost, dec!(3.1416));
    }
}
