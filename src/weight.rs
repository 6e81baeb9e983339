//! Request weight validation.
//!
//! The exchange caps every market data request at a fixed number of points
//! (200 by default). Each market in the request costs one base point plus the
//! points of every projection asked for:
//!
//! | Market projection | Points | Price projection | Points |
//! |-------------------|--------|------------------|--------|
//! | COMPETITION | 1 | EX_BEST_OFFERS | 2 |
//! | EVENT | 1 | EX_ALL_OFFERS | 5 |
//! | EVENT_TYPE | 1 | EX_TRADED | 3 |
//! | MARKET_DESCRIPTION | 1 | SP_AVAILABLE | 1 |
//! | RUNNER_DESCRIPTION | 1 | SP_TRADED | 1 |
//! | RUNNER_METADATA | 2 | | |
//! | MARKET_START_TIME | 1 | | |
//!
//! Order and match projections on a market book add 2 points each.
//!
//! Validation is pure and runs before any permit is taken, so an oversized
//! request never spends quota.

use crate::remote::{OperationKind, OperationParams};
use crate::{Error, Result};

/// Base weight per market.
pub const BASE_WEIGHT_PER_MARKET: u32 = 1;

/// Weight of an order projection on a market book.
pub const ORDER_PROJECTION_WEIGHT: u32 = 2;

/// Weight of a match projection on a market book.
pub const MATCH_PROJECTION_WEIGHT: u32 = 2;

/// Default per-request ceiling.
pub const DEFAULT_WEIGHT_BUDGET: u32 = 200;

const MARKET_PROJECTION_WEIGHTS: &[(&str, u32)] = &[
    ("COMPETITION", 1),
    ("EVENT", 1),
    ("EVENT_TYPE", 1),
    ("MARKET_DESCRIPTION", 1),
    ("RUNNER_DESCRIPTION", 1),
    ("RUNNER_METADATA", 2),
    ("MARKET_START_TIME", 1),
];

const PRICE_PROJECTION_WEIGHTS: &[(&str, u32)] = &[
    ("EX_BEST_OFFERS", 2),
    ("EX_ALL_OFFERS", 5),
    ("EX_TRADED", 3),
    ("SP_AVAILABLE", 1),
    ("SP_TRADED", 1),
];

fn lookup(table: &[(&str, u32)], projection: &str) -> Option<u32> {
    let upper = projection.trim().to_ascii_uppercase();
    table
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, weight)| *weight)
}

/// Computed cost of one request. Derived per call, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationCost {
    /// Points this request costs
    pub weight: u32,
    /// Ceiling it was checked against
    pub budget: u32,
}

impl OperationCost {
    pub fn within_budget(&self) -> bool {
        self.weight <= self.budget
    }

    /// Points left under the ceiling.
    pub fn headroom(&self) -> u32 {
        self.budget.saturating_sub(self.weight)
    }
}

/// Stateless cost calculator bound to a budget ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightValidator {
    budget: u32,
}

impl Default for WeightValidator {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHT_BUDGET)
    }
}

impl WeightValidator {
    pub fn new(budget: u32) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Compute the request cost and reject it if it exceeds the budget.
    ///
    /// # Errors
    /// - `UnsupportedParameter` for an unknown projection, or a projection
    ///   the operation does not accept
    /// - `CostExceeded` when the weight is over budget
    pub fn validate(&self, kind: OperationKind, params: &OperationParams) -> Result<OperationCost> {
        let weight = self.weight(kind, params)?;
        let cost = OperationCost {
            weight,
            budget: self.budget,
        };
        if !cost.within_budget() {
            return Err(Error::cost_exceeded(kind.method(), weight, self.budget));
        }
        Ok(cost)
    }

    /// Raw weight of a request, without checking it against the budget.
    pub fn weight(&self, kind: OperationKind, params: &OperationParams) -> Result<u32> {
        match kind {
            OperationKind::ListMarketCatalogue => {
                reject_present(kind, "priceProjection", !params.price_projection.is_empty())?;
                reject_present(kind, "orderProjection", params.order_projection.is_some())?;
                reject_present(kind, "matchProjection", params.match_projection.is_some())?;

                let per_market = catalogue_weight_per_market(kind, &params.market_projection)?;
                let markets = match params.max_results {
                    Some(max) => max,
                    None => params.market_ids.len() as u32,
                };
                Ok(markets.saturating_mul(per_market))
            }
            OperationKind::ListMarketBook => {
                reject_present(kind, "marketProjection", !params.market_projection.is_empty())?;
                reject_present(kind, "maxResults", params.max_results.is_some())?;

                let mut per_market = book_weight_per_market(kind, &params.price_projection)?;
                if params.order_projection.is_some() {
                    per_market += ORDER_PROJECTION_WEIGHT;
                }
                if params.match_projection.is_some() {
                    per_market += MATCH_PROJECTION_WEIGHT;
                }
                Ok((params.market_ids.len() as u32).saturating_mul(per_market))
            }
            _ => {
                reject_present(kind, "marketIds", !params.market_ids.is_empty())?;
                reject_present(kind, "marketProjection", !params.market_projection.is_empty())?;
                reject_present(kind, "priceProjection", !params.price_projection.is_empty())?;
                reject_present(kind, "orderProjection", params.order_projection.is_some())?;
                reject_present(kind, "matchProjection", params.match_projection.is_some())?;
                if kind.is_account() {
                    reject_present(kind, "maxResults", params.max_results.is_some())?;
                    reject_present(kind, "filter", !params.filter.is_null())?;
                }
                Ok(0)
            }
        }
    }

    /// How many markets fit in one request with the given projections.
    ///
    /// Price projections select the market book table; otherwise market
    /// projections select the catalogue table.
    pub fn max_markets_per_request(
        &self,
        market_projection: &[String],
        price_projection: &[String],
    ) -> Result<u32> {
        let per_market = weight_per_market(market_projection, price_projection)?;
        Ok(self.budget / per_market)
    }

    /// Split market ids into chunks that each fit the budget.
    pub fn split_markets_by_weight(
        &self,
        market_ids: &[String],
        market_projection: &[String],
        price_projection: &[String],
    ) -> Result<Vec<Vec<String>>> {
        let per_market = weight_per_market(market_projection, price_projection)?;
        let max_markets = self.budget / per_market;
        if max_markets == 0 {
            return Err(Error::cost_exceeded("single market", per_market, self.budget));
        }

        let chunks: Vec<Vec<String>> = market_ids
            .chunks(max_markets as usize)
            .map(<[String]>::to_vec)
            .collect();

        if chunks.len() > 1 {
            tracing::debug!(
                markets = market_ids.len(),
                chunks = chunks.len(),
                max_markets,
                "Split markets to respect weight budget"
            );
        }
        Ok(chunks)
    }
}

fn weight_per_market(market_projection: &[String], price_projection: &[String]) -> Result<u32> {
    if !price_projection.is_empty() {
        book_weight_per_market(OperationKind::ListMarketBook, price_projection)
    } else {
        catalogue_weight_per_market(OperationKind::ListMarketCatalogue, market_projection)
    }
}

fn catalogue_weight_per_market(kind: OperationKind, projections: &[String]) -> Result<u32> {
    projections
        .iter()
        .try_fold(BASE_WEIGHT_PER_MARKET, |acc, p| {
            lookup(MARKET_PROJECTION_WEIGHTS, p)
                .map(|w| acc + w)
                .ok_or_else(|| Error::unsupported(kind.method(), format!("marketProjection {p}")))
        })
}

fn book_weight_per_market(kind: OperationKind, projections: &[String]) -> Result<u32> {
    projections
        .iter()
        .try_fold(BASE_WEIGHT_PER_MARKET, |acc, p| {
            lookup(PRICE_PROJECTION_WEIGHTS, p)
                .map(|w| acc + w)
                .ok_or_else(|| Error::unsupported(kind.method(), format!("priceProjection {p}")))
        })
}

fn reject_present(kind: OperationKind, parameter: &str, present: bool) -> Result<()> {
    if present {
        return Err(Error::unsupported(kind.method(), parameter));
    }
    Ok(())
}
