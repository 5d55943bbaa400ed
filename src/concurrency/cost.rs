//! Usage and cost accounting for remote calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Price of one model, in currency units per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Prices keyed by model (resource) identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceTable {
    prices: HashMap<String, Price>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, model: impl Into<String>, price: Price) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    pub fn get(&self, model: &str) -> Option<Price> {
        self.prices.get(model).copied()
    }

    /// Build the record for one call. Unknown models cost nothing.
    pub fn record(
        &self,
        model: &str,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostRecord {
        let (input_cost, output_cost) = match self.get(model) {
            Some(p) => (
                input_tokens as f64 / 1000.0 * p.input_per_1k,
                output_tokens as f64 / 1000.0 * p.output_per_1k,
            ),
            None => (0.0, 0.0),
        };
        CostRecord {
            model: model.to_string(),
            provider: provider.to_string(),
            input_tokens,
            output_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub request_count: usize,
    pub by_model: BTreeMap<String, ModelUsage>,
}

/// Append-only, in-memory ledger shared by every caller of a client.
#[derive(Debug, Default)]
pub struct CostLedger {
    records: Mutex<Vec<CostRecord>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: CostRecord) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn total_cost(&self) -> f64 {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|r| r.total_cost)
            .sum()
    }

    pub fn summary(&self) -> CostSummary {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut summary = CostSummary::default();
        for r in records.iter() {
            summary.total_cost += r.total_cost;
            summary.total_input_tokens += r.input_tokens;
            summary.total_output_tokens += r.output_tokens;
            summary.request_count += 1;

            let usage = summary.by_model.entry(r.model.clone()).or_default();
            usage.cost += r.total_cost;
            usage.input_tokens += r.input_tokens;
            usage.output_tokens += r.output_tokens;
            usage.count += 1;
        }
        summary
    }
}
