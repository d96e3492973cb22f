use super::types::{GreeksSource, OccSymbol, OptionContract, QuoteField, RawContract};
use crate::errors::{require_positive, EngineError, EngineResult};
use crate::models::implied_vol::ImpliedVolSolver;
use crate::models::PricingModel;
use crate::state::{MarketInputs, OptionType, PricingInputs};
use chrono::{DateTime, NaiveDate};

/// Maps heterogeneous provider records onto `OptionContract`.
///
/// Pure data mapping: the only derived values are mid (when the provider
/// omits it), the in-the-money flag and moneyness.
#[derive(Debug, Clone)]
pub struct ChainNormalizer {
    /// Tag used when a record carries no `source` of its own.
    default_source: String,
}

impl ChainNormalizer {
    pub fn new(default_source: impl Into<String>) -> Self {
        Self {
            default_source: default_source.into(),
        }
    }

    /// Normalizes every record, failing on the first one that cannot be mapped.
    pub fn normalize(&self, raw: &[RawContract], underlying_price: f64) -> EngineResult<Vec<OptionContract>> {
        require_positive("underlying_price", underlying_price)?;
        raw.iter()
            .map(|r| self.normalize_one(r, underlying_price))
            .collect()
    }

    /// Like `normalize`, but keeps going past bad records and returns them
    /// with their errors alongside the contracts that did map.
    pub fn normalize_partial(
        &self,
        raw: &[RawContract],
        underlying_price: f64,
    ) -> EngineResult<(Vec<OptionContract>, Vec<(usize, EngineError)>)> {
        require_positive("underlying_price", underlying_price)?;
        let mut contracts = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();
        for (i, r) in raw.iter().enumerate() {
            match self.normalize_one(r, underlying_price) {
                Ok(c) => contracts.push(c),
                Err(e) => {
                    tracing::warn!(index = i, symbol = ?r.symbol, error = %e, "rejected contract");
                    rejected.push((i, e));
                }
            }
        }
        Ok((contracts, rejected))
    }

    /// Normalizes, then computes Greeks for contracts the provider sent
    /// without them, using the provider's implied volatility.
    pub fn normalize_with_greeks(
        &self,
        raw: &[RawContract],
        underlying_price: f64,
        as_of: NaiveDate,
        rate: f64,
        dividend_yield: f64,
        model: &dyn PricingModel,
    ) -> EngineResult<Vec<OptionContract>> {
        let contracts = self.normalize(raw, underlying_price)?;
        compute_missing_greeks(contracts, as_of, rate, dividend_yield, model)
    }

    pub fn normalize_one(&self, raw: &RawContract, underlying_price: f64) -> EngineResult<OptionContract> {
        let occ = raw.symbol.as_deref().and_then(OccSymbol::parse);

        let option_type = match raw.contract_type.as_deref() {
            Some(t) => parse_option_type(t)?,
            None => occ
                .as_ref()
                .map(|o| o.option_type)
                .ok_or_else(|| EngineError::invalid("contract_type", "missing"))?,
        };

        let strike = raw
            .strike
            .or_else(|| occ.as_ref().map(|o| o.strike))
            .ok_or_else(|| EngineError::invalid("strike", "missing"))?;
        require_positive("strike", strike)?;

        let expiration = match parse_expiration(raw)? {
            Some(d) => d,
            None => occ
                .as_ref()
                .map(|o| o.expiration)
                .ok_or_else(|| EngineError::invalid("expiration", "missing"))?,
        };

        let underlying = raw
            .underlying
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| occ.as_ref().map(|o| o.root.clone()))
            .ok_or_else(|| EngineError::invalid("underlying", "missing"))?;

        let symbol = match raw.symbol.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => OccSymbol {
                root: underlying.clone(),
                expiration,
                option_type,
                strike,
            }
            .format(),
        };

        let bid = QuoteField::from_raw(raw.bid);
        let ask = QuoteField::from_raw(raw.ask);
        let mid = match QuoteField::from_raw(raw.mid) {
            m if m.present => m,
            _ => match (bid.get(), ask.get()) {
                (Some(b), Some(a)) => QuoteField {
                    value: 0.5 * (b + a),
                    present: true,
                },
                _ => QuoteField::ABSENT,
            },
        };

        let greeks = raw.greeks.as_ref().and_then(|g| g.to_greeks());

        Ok(OptionContract {
            symbol,
            underlying,
            option_type,
            strike,
            expiration,
            last: QuoteField::from_raw(raw.last),
            bid,
            ask,
            mid,
            volume: QuoteField::from_raw(raw.volume),
            open_interest: QuoteField::from_raw(raw.open_interest),
            implied_volatility: QuoteField::from_raw(raw.implied_volatility),
            greeks_source: greeks.map(|_| GreeksSource::Provider),
            greeks,
            underlying_price,
            in_the_money: option_type.is_in_the_money(strike, underlying_price),
            moneyness: underlying_price / strike,
            source: raw
                .source
                .clone()
                .unwrap_or_else(|| self.default_source.clone()),
        })
    }
}

/// Solves implied volatility for contracts the provider sent without one,
/// from their mid (or last) price. Contracts that cannot be solved keep an
/// absent IV; nothing is defaulted.
pub fn fill_implied_vols(
    contracts: &[OptionContract],
    solver: &ImpliedVolSolver<'_>,
    as_of: NaiveDate,
    rate: f64,
    dividend_yield: f64,
) -> Vec<OptionContract> {
    contracts
        .iter()
        .map(|c| {
            let mut out = c.clone();
            if c.implied_volatility.present {
                return out;
            }
            let Some(price) = c.reference_price() else {
                return out;
            };
            let market = MarketInputs {
                option_type: c.option_type,
                spot: c.underlying_price,
                strike: c.strike,
                time_to_expiry: c.time_to_expiry(as_of),
                rate,
                dividend_yield,
            };
            match solver.solve(price, &market) {
                Ok(iv) => {
                    out.implied_volatility = QuoteField {
                        value: iv,
                        present: true,
                    }
                }
                Err(e) => tracing::debug!(symbol = %c.symbol, error = %e, "implied vol unavailable"),
            }
            out
        })
        .collect()
}

/// Orders a chain by expiration, then strike, calls before puts.
pub fn sort_chain(contracts: &mut [OptionContract]) {
    contracts.sort_by(|a, b| {
        a.expiration
            .cmp(&b.expiration)
            .then(a.strike.total_cmp(&b.strike))
            .then(a.option_type.cmp(&b.option_type))
    });
}

/// Fills Greeks from the contract's implied volatility wherever the provider
/// sent none. Contracts without a usable IV are left as they are.
pub fn compute_missing_greeks(
    contracts: Vec<OptionContract>,
    as_of: NaiveDate,
    rate: f64,
    dividend_yield: f64,
    model: &dyn PricingModel,
) -> EngineResult<Vec<OptionContract>> {
    contracts
        .into_iter()
        .map(|c| with_computed_greeks(c, as_of, rate, dividend_yield, model))
        .collect()
}

fn with_computed_greeks(
    mut contract: OptionContract,
    as_of: NaiveDate,
    rate: f64,
    dividend_yield: f64,
    model: &dyn PricingModel,
) -> EngineResult<OptionContract> {
    if contract.greeks.is_some() {
        return Ok(contract);
    }
    let Some(iv) = contract.implied_volatility.get().filter(|v| *v > 0.0) else {
        return Ok(contract);
    };
    let inputs = PricingInputs::new(
        contract.option_type,
        contract.underlying_price,
        contract.strike,
        contract.time_to_expiry(as_of),
        iv,
        rate,
        dividend_yield,
    );
    contract.greeks = Some(model.greeks(&inputs)?);
    contract.greeks_source = Some(GreeksSource::Computed);
    Ok(contract)
}

fn parse_option_type(raw: &str) -> EngineResult<OptionType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "call" | "c" | "calls" => Ok(OptionType::Call),
        "put" | "p" | "puts" => Ok(OptionType::Put),
        _ => Err(EngineError::UnsupportedContractType(raw.to_string())),
    }
}

fn parse_expiration(raw: &RawContract) -> EngineResult<Option<NaiveDate>> {
    if let Some(s) = raw.expiration.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return parse_date(s)
            .map(Some)
            .ok_or_else(|| EngineError::invalid("expiration", format!("unparseable date {s:?}")));
    }
    if let Some(ts) = raw.expiration_timestamp {
        return DateTime::from_timestamp(ts, 0)
            .map(|dt| Some(dt.date_naive()))
            .ok_or_else(|| EngineError::invalid("expiration", format!("bad timestamp {ts}")));
    }
    Ok(None)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(s, "%Y%m%d").ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}
