//! Seed-backed retrieval collaborators
//!
//! | Task | Collaborator | Source |
//! |---|---|---|
//! | `vector` | [`SeedRetriever`] | keyword scoring over seed markets |
//! | `metadata` | [`MetadataScan`] | region match over market locations |
//! | `seller_guide` | [`SellerGuide`] | seller zones and their cells |
//! | `web` | none by default | reported as unavailable by the dispatcher |
//!
//! All three read one shared, immutable [`SeedDataset`] and are safe to call
//! from concurrent dispatch branches.

use crate::dataset::{Market, SeedDataset, Zone};
use async_trait::async_trait;
use flowgraph_core::{CollaboratorError, Record, Retriever, SearchFilter};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Filter key understood by [`MetadataScan`] to force a region
pub const REGION_FILTER: &str = "region";

const SEED_SOURCE: &str = "seed_dataset";
const NEXT_STEP: &str = "온라인 신청서 작성 후 서류 업로드";

/// Keyword search over seed markets
///
/// Markets with no keyword match are dropped, the rest are ordered by score
/// (rating included) and then by id.
pub struct SeedRetriever {
    dataset: Arc<SeedDataset>,
}

impl SeedRetriever {
    pub fn new(dataset: Arc<SeedDataset>) -> Self {
        Self { dataset }
    }
}

#[async_trait]
impl Retriever for SeedRetriever {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<Record>, CollaboratorError> {
        let mut scored: Vec<(f64, &Market)> = self
            .dataset
            .markets
            .iter()
            .filter(|market| market.keyword_score(query) > 0.0)
            .map(|market| (market.score(query), market))
            .collect();
        scored.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .total_cmp(a_score)
                .then_with(|| a.market_id.cmp(&b.market_id))
        });

        let records: Vec<Record> = scored
            .into_iter()
            .map(|(score, market)| market_record(market, Some(score)))
            .filter(|record| filter.map_or(true, |f| matches_filter(&record.fields, f)))
            .take(limit)
            .collect();
        debug!(query = %query, found = records.len(), "Seed search finished");
        Ok(records)
    }
}

/// Structured scan: markets located in the regions a query names
pub struct MetadataScan {
    dataset: Arc<SeedDataset>,
}

impl MetadataScan {
    pub fn new(dataset: Arc<SeedDataset>) -> Self {
        Self { dataset }
    }
}

#[async_trait]
impl Retriever for MetadataScan {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<Record>, CollaboratorError> {
        let places: Vec<String> = match filter.and_then(|f| f.get(REGION_FILTER)).and_then(Value::as_str) {
            Some(region) => vec![region.to_string()],
            None => self.dataset.regions_in(query).iter().map(|r| r.name.clone()).collect(),
        };
        if places.is_empty() {
            return Ok(Vec::new());
        }

        let mut markets: Vec<&Market> = self
            .dataset
            .markets
            .iter()
            .filter(|market| places.iter().any(|place| market.located_in(place)))
            .collect();
        markets.sort_by(|a, b| {
            b.market_rating
                .partial_cmp(&a.market_rating)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.market_id.cmp(&b.market_id))
        });
        Ok(markets
            .into_iter()
            .take(limit)
            .map(|market| market_record(market, market.market_rating))
            .collect())
    }
}

/// Seller onboarding guidance from seed zones
///
/// Zones in the regions the query names come first; with no region match the
/// first zones of the dataset are used. Each zone suggests its first approved
/// cell, or its first cell when none is approved, and zones without cells are
/// skipped.
pub struct SellerGuide {
    dataset: Arc<SeedDataset>,
}

impl SellerGuide {
    pub fn new(dataset: Arc<SeedDataset>) -> Self {
        Self { dataset }
    }

    fn zone_record(zone: &Zone) -> Option<Record> {
        let cell = zone
            .cells
            .iter()
            .find(|cell| cell.is_approved())
            .or_else(|| zone.cells.first())?;
        let guide = json!({
            "zone": zone.name,
            "theme": zone.theme.as_deref().unwrap_or("일반"),
            "features": zone.features,
            "suggested_cell": cell.label.as_deref().unwrap_or("미정"),
            "cell_notice": cell.notice.as_deref().unwrap_or("추가 안내 없음"),
            "next_step": NEXT_STEP,
            "source": SEED_SOURCE,
        });
        Some(Record {
            id: zone.zone_id.clone(),
            fields: into_fields(&guide),
            score: None,
        })
    }
}

#[async_trait]
impl Retriever for SellerGuide {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        _filter: Option<&SearchFilter>,
    ) -> Result<Vec<Record>, CollaboratorError> {
        let regions: Vec<&str> = self
            .dataset
            .regions_in(query)
            .iter()
            .map(|r| r.region_id.as_str())
            .collect();
        let mut zones: Vec<&Zone> = self
            .dataset
            .zones
            .iter()
            .filter(|zone| regions.is_empty() || regions.contains(&zone.region_id.as_str()))
            .collect();
        if zones.is_empty() {
            zones = self.dataset.zones.iter().take(limit).collect();
        }
        Ok(zones
            .into_iter()
            .take(limit)
            .filter_map(Self::zone_record)
            .collect())
    }
}

fn market_record(market: &Market, score: Option<f64>) -> Record {
    Record {
        id: market.market_id.clone(),
        fields: into_fields(&market.to_item()),
        score,
    }
}

fn into_fields<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Every filter entry must equal the field, or be contained in it for lists
fn matches_filter(fields: &Map<String, Value>, filter: &SearchFilter) -> bool {
    filter.iter().all(|(key, expected)| match fields.get(key) {
        Some(Value::Array(items)) => items.contains(expected),
        Some(actual) => actual == expected,
        None => false,
    })
}
