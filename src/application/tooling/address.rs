//! Built-in address capabilities: normalization and forward geocoding.

use super::{Tool, ToolInvokeError};
use crate::domain::types::ToolDefinition;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct AddressArgs {
    address: String,
}

fn parse_address_args(arguments: Value) -> Result<String, ToolInvokeError> {
    let args: AddressArgs = serde_json::from_value(arguments)
        .map_err(|err| ToolInvokeError::InvalidArguments(err.to_string()))?;
    let address = args.address.trim().to_string();
    if address.is_empty() {
        return Err(ToolInvokeError::InvalidArguments(
            "address must not be empty".into(),
        ));
    }
    Ok(address)
}

fn address_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "address": {
                "type": "string",
                "description": "Free-form postal address"
            }
        },
        "required": ["address"]
    })
}

/// Canonicalizes a free-form address string: collapses whitespace and expands
/// common street-type abbreviations.
pub struct NormalizeAddress;

// "St" also abbreviates Saint; street expansion is the common case on call
// sheets, so we accept the occasional Saint-Street mixup.
const EXPANSIONS: &[(&str, &str)] = &[
    ("st", "Street"),
    ("ave", "Avenue"),
    ("blvd", "Boulevard"),
    ("rd", "Road"),
    ("dr", "Drive"),
    ("ln", "Lane"),
    ("hwy", "Highway"),
    ("pl", "Place"),
    ("sq", "Square"),
];

fn normalize(address: &str) -> String {
    let mut parts = Vec::new();
    for token in address.split_whitespace() {
        let (word, punctuation) = match token.find(|c| c == ',' || c == '.') {
            Some(index) => token.split_at(index),
            None => (token, ""),
        };
        let punctuation = if punctuation.starts_with(',') { "," } else { "" };
        let lowered = word.to_lowercase();
        let expanded = EXPANSIONS
            .iter()
            .find(|(abbr, _)| *abbr == lowered)
            .map(|(_, full)| (*full).to_string())
            .unwrap_or_else(|| word.to_string());
        parts.push(format!("{expanded}{punctuation}"));
    }
    parts.join(" ")
}

#[async_trait]
impl Tool for NormalizeAddress {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "normalize_address".into(),
            description: "Normalizes a postal address into a canonical form suitable for geocoding."
                .into(),
            parameters: address_parameters(),
        }
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolInvokeError> {
        let address = parse_address_args(arguments)?;
        let normalized = normalize(&address);
        debug!(address = address.as_str(), "Normalized address");
        Ok(json!({ "address": normalized }))
    }
}

/// Forward-geocodes an address against a Nominatim-style search endpoint.
pub struct GeocodeAddress {
    http: Client,
    base_url: String,
}

impl GeocodeAddress {
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            http: client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        format!("{trimmed}/search")
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
    display_name: String,
}

#[async_trait]
impl Tool for GeocodeAddress {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "geocode_address".into(),
            description: "Resolves a postal address to geographic coordinates.".into(),
            parameters: address_parameters(),
        }
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolInvokeError> {
        let address = parse_address_args(arguments)?;
        let url = self.endpoint();
        info!(url = %url, "Geocoding address");

        let hits: Vec<GeocodeHit> = self
            .http
            .get(&url)
            .query(&[("q", address.as_str()), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(|err| ToolInvokeError::Execution(err.to_string()))?
            .error_for_status()
            .map_err(|err| ToolInvokeError::Execution(err.to_string()))?
            .json()
            .await
            .map_err(|err| ToolInvokeError::Execution(err.to_string()))?;

        let hit = hits
            .into_iter()
            .next()
            .ok_or_else(|| ToolInvokeError::Execution(format!("no match for '{address}'")))?;

        Ok(json!({
            "lat": hit.lat,
            "lon": hit.lon,
            "display_name": hit.display_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expands_abbreviations_and_collapses_whitespace() {
        let result = NormalizeAddress
            .invoke(json!({ "address": "  123   Main st,  Springfield " }))
            .await
            .expect("normalization succeeds");
        assert_eq!(result["address"], "123 Main Street, Springfield");
    }

    #[tokio::test]
    async fn leaves_unknown_tokens_untouched() {
        let result = NormalizeAddress
            .invoke(json!({ "address": "45 Sunset Blvd. Los Angeles" }))
            .await
            .expect("normalization succeeds");
        assert_eq!(result["address"], "45 Sunset Boulevard Los Angeles");
    }

    #[tokio::test]
    async fn missing_address_is_invalid_arguments() {
        let err = NormalizeAddress
            .invoke(json!({}))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ToolInvokeError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn blank_address_is_invalid_arguments() {
        let err = NormalizeAddress
            .invoke(json!({ "address": "   " }))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ToolInvokeError::InvalidArguments(_)));
    }

    #[test]
    fn geocoder_endpoint_joins_base_url() {
        let tool = GeocodeAddress::new("https://nominatim.example.org/", Client::new());
        assert_eq!(tool.endpoint(), "https://nominatim.example.org/search");
    }
}
