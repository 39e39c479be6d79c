//! Seed dataset: markets, regions, seller zones and guardrail lists
//!
//! The seed file is a single JSON document loaded once at startup and shared
//! read-only by every collaborator that needs it:
//!
//! ```json
//! {
//!   "markets":    [{ "market_id": "...", "market_name": "...", "market_location": [...] }],
//!   "regions":    [{ "region_id": "...", "name": "동구" }],
//!   "zones":      [{ "zone_id": "...", "region_id": "...", "cells": [...] }],
//!   "guardrails": { "forbidden_keywords": [...], "disallowed_topics": [...], "service_area": "..." }
//! }
//! ```
//!
//! Market list fields are lenient: a bare string is read as a one-item list
//! and blank entries are dropped.

use crate::error::{ChatbotError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::info;

const DESCRIPTION_LIMIT: usize = 140;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedDataset {
    pub markets: Vec<Market>,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    #[serde(default)]
    pub market_name: Option<String>,
    #[serde(default)]
    pub market_category: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub market_attribute: Vec<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub market_ameni: Vec<String>,
    #[serde(default)]
    pub market_location: Vec<Location>,
    #[serde(default)]
    pub market_rating: Option<f64>,
    #[serde(default)]
    pub market_description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub city: String,
    pub district: String,
    pub address: String,
    pub zone_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub region_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub region_id: String,
    pub name: String,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub features: Vec<String>,
    #[serde(default)]
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub label: Option<String>,
    pub status: String,
    #[serde(default)]
    pub notice: Option<String>,
}

impl Cell {
    pub fn is_approved(&self) -> bool {
        self.status.eq_ignore_ascii_case("APPROVED")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub forbidden_keywords: Vec<String>,
    pub disallowed_topics: Vec<String>,
    pub service_area: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            forbidden_keywords: Vec::new(),
            disallowed_topics: Vec::new(),
            service_area: "광주광역시".to_string(),
        }
    }
}

/// Display view of a market, the shape stored under `evidence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketItem {
    pub name: String,
    pub category: String,
    pub attributes: Vec<String>,
    pub amenities: Vec<String>,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    pub description: String,
    pub source: String,
}

impl SeedDataset {
    /// Read and parse the seed file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ChatbotError::dataset(path, e.to_string()))?;
        let dataset = Self::from_json(&content).map_err(|e| match e {
            ChatbotError::Serialization(e) => ChatbotError::dataset(path, e.to_string()),
            other => other,
        })?;
        info!(
            path = %path.display(),
            markets = dataset.markets.len(),
            zones = dataset.zones.len(),
            "Seed dataset loaded"
        );
        Ok(dataset)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Regions whose name appears in the query
    pub fn regions_in(&self, query: &str) -> Vec<&Region> {
        let lowered = query.to_lowercase();
        self.regions
            .iter()
            .filter(|region| !region.name.is_empty() && lowered.contains(&region.name.to_lowercase()))
            .collect()
    }

    pub fn market(&self, id: &str) -> Option<&Market> {
        self.markets.iter().find(|m| m.market_id == id)
    }
}

impl Market {
    pub fn name(&self) -> &str {
        non_blank(&self.market_name).unwrap_or("이름 미정")
    }

    pub fn category(&self) -> &str {
        non_blank(&self.market_category).unwrap_or("플리마켓")
    }

    /// `city district` per location, falling back to the address, then the zone
    pub fn location_label(&self) -> String {
        let labels: Vec<String> = self
            .market_location
            .iter()
            .filter_map(|loc| {
                let place: Vec<&str> = [loc.city.trim(), loc.district.trim()]
                    .into_iter()
                    .filter(|part| !part.is_empty())
                    .collect();
                if !place.is_empty() {
                    Some(place.join(" "))
                } else if !loc.address.trim().is_empty() {
                    Some(loc.address.trim().to_string())
                } else if !loc.zone_id.trim().is_empty() {
                    Some(loc.zone_id.trim().to_string())
                } else {
                    None
                }
            })
            .collect();
        labels.join(", ")
    }

    /// Whether any location mentions `place`
    pub fn located_in(&self, place: &str) -> bool {
        let place = place.to_lowercase();
        self.market_location.iter().any(|loc| {
            [&loc.city, &loc.district, &loc.address]
                .iter()
                .any(|field| !field.is_empty() && field.to_lowercase().contains(&place))
        })
    }

    /// Keyword relevance of this market to a query
    ///
    /// | Match | Weight |
    /// |---|---|
    /// | category named in query | 3.0 |
    /// | each attribute named in query | 1.0 |
    /// | each amenity named in query | 0.5 |
    /// | each location with a city, district or address named in query | 1.5 |
    /// | whole query inside the description | 0.5 |
    /// | rating | rating / 5, at most 1.0 |
    pub fn score(&self, query: &str) -> f64 {
        if query.trim().is_empty() {
            return 0.0;
        }
        self.keyword_score(query) + self.market_rating.map(|r| (r / 5.0).min(1.0)).unwrap_or(0.0)
    }

    /// [`score`](Self::score) without the rating bonus
    pub fn keyword_score(&self, query: &str) -> f64 {
        let lowered = query.trim().to_lowercase();
        if lowered.is_empty() {
            return 0.0;
        }
        let mentioned = |term: &str| {
            let term = term.trim().to_lowercase();
            !term.is_empty() && lowered.contains(&term)
        };

        let mut score = 0.0;
        if self.market_category.as_deref().is_some_and(mentioned) {
            score += 3.0;
        }
        score += self.market_attribute.iter().filter(|a| mentioned(a.as_str())).count() as f64;
        score += 0.5 * self.market_ameni.iter().filter(|a| mentioned(a.as_str())).count() as f64;
        for loc in &self.market_location {
            if [&loc.city, &loc.district, &loc.address].into_iter().any(|token| mentioned(token.as_str())) {
                score += 1.5;
            }
        }
        if let Some(description) = &self.market_description {
            if description.to_lowercase().contains(&lowered) {
                score += 0.5;
            }
        }
        score
    }

    pub fn to_item(&self) -> MarketItem {
        let location = self.location_label();
        MarketItem {
            name: self.name().to_string(),
            category: self.category().to_string(),
            attributes: self.market_attribute.clone(),
            amenities: self.market_ameni.clone(),
            location: if location.is_empty() { "광주 전역".to_string() } else { location },
            rating: self.market_rating,
            description: self
                .market_description
                .as_deref()
                .map(|d| short_description(d, DESCRIPTION_LIMIT))
                .unwrap_or_default(),
            source: self.market_id.clone(),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Collapse whitespace and cut to `limit` characters with a trailing `...`
pub fn short_description(text: &str, limit: usize) -> String {
    let squashed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if squashed.chars().count() <= limit {
        return squashed;
    }
    let trimmed: String = squashed.chars().take(limit.saturating_sub(1)).collect();
    format!("{}...", trimmed.trim_end())
}

fn lenient_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn market() -> Market {
        serde_json::from_value(json!({
            "market_id": "m-1",
            "market_name": "양림 야간 플리마켓",
            "market_category": "플리마켓",
            "market_attribute": ["야간", "빈티지", " "],
            "market_ameni": "주차",
            "market_location": [{"city": "광주광역시", "district": "남구", "address": "양림동"}],
            "market_rating": 4.5,
            "market_description": "양림동   골목에서 열리는 밤 시장"
        }))
        .unwrap()
    }

    #[test]
    fn test_lenient_lists() {
        let market = market();
        assert_eq!(market.market_attribute, vec!["야간", "빈티지"]);
        assert_eq!(market.market_ameni, vec!["주차"]);
    }

    #[test]
    fn test_score_weights() {
        let market = market();
        // category 3 + 야간 1 + 남구 1.5 + rating 0.9
        let score = market.score("남구 야간 플리마켓");
        assert!((score - 6.4).abs() < 1e-9, "score was {score}");
        assert_eq!(market.score("   "), 0.0);
        assert!((market.keyword_score("남구 야간 플리마켓") - 5.5).abs() < 1e-9);
        assert_eq!(market.keyword_score("반려동물"), 0.0);
    }

    #[test]
    fn test_score_counts_a_location_once() {
        let market = market();
        let both = market.score("광주광역시 남구");
        let one = market.score("남구");
        assert!((both - one).abs() < 1e-9);
    }

    #[test]
    fn test_to_item_defaults() {
        let bare: Market = serde_json::from_value(json!({"market_id": "m-2"})).unwrap();
        let item = bare.to_item();
        assert_eq!(item.name, "이름 미정");
        assert_eq!(item.category, "플리마켓");
        assert_eq!(item.location, "광주 전역");
        assert_eq!(item.description, "");

        let item = market().to_item();
        assert_eq!(item.location, "광주광역시 남구");
        assert_eq!(item.description, "양림동 골목에서 열리는 밤 시장");
    }

    #[test]
    fn test_short_description_counts_characters() {
        assert_eq!(short_description("가나다라마", 5), "가나다라마");
        assert_eq!(short_description("가나다라마바", 5), "가나다라...");
    }

    #[test]
    fn test_regions_in_query() {
        let dataset = SeedDataset {
            regions: vec![
                Region { region_id: "r-1".into(), name: "동구".into() },
                Region { region_id: "r-2".into(), name: "광산구".into() },
            ],
            ..Default::default()
        };
        let found: Vec<&str> = dataset.regions_in("광산구 주말 마켓").iter().map(|r| r.region_id.as_str()).collect();
        assert_eq!(found, vec!["r-2"]);
    }

    #[tokio::test]
    async fn test_bundled_seed_parses() {
        let dataset = SeedDataset::load(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/data/seed.json")))
            .await
            .unwrap();
        assert!(!dataset.markets.is_empty());
        assert!(!dataset.zones.is_empty());
        assert!(!dataset.guardrails.forbidden_keywords.is_empty());
    }

    #[tokio::test]
    async fn test_missing_seed_names_path() {
        let err = SeedDataset::load(Path::new("/nonexistent/seed.json")).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/seed.json"));
    }
}
