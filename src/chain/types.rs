use crate::state::{GreeksResult, OptionType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Raw provider records ──

/// One contract as a market-data provider returns it. Every field is optional;
/// providers disagree on names, so the common spellings are accepted as aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawContract {
    #[serde(alias = "contract_symbol", alias = "ticker")]
    pub symbol: Option<String>,
    #[serde(alias = "underlying_symbol", alias = "root")]
    pub underlying: Option<String>,
    #[serde(alias = "type", alias = "option_type", alias = "right")]
    pub contract_type: Option<String>,
    #[serde(alias = "strike_price")]
    pub strike: Option<f64>,
    /// `YYYY-MM-DD`, `YYYYMMDD` or RFC 3339.
    #[serde(alias = "expiry", alias = "expiration_date")]
    pub expiration: Option<String>,
    /// Unix seconds, used when `expiration` is absent.
    pub expiration_timestamp: Option<i64>,
    #[serde(alias = "last_price", alias = "lastPrice")]
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mid: Option<f64>,
    pub volume: Option<f64>,
    #[serde(alias = "oi", alias = "openInterest")]
    pub open_interest: Option<f64>,
    #[serde(alias = "iv", alias = "impliedVolatility")]
    pub implied_volatility: Option<f64>,
    pub greeks: Option<RawGreeks>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawGreeks {
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
}

impl RawGreeks {
    /// All four core Greeks are needed; rho is commonly omitted and reads as 0.
    pub fn to_greeks(&self) -> Option<GreeksResult> {
        Some(GreeksResult {
            delta: finite(self.delta)?,
            gamma: finite(self.gamma)?,
            theta: finite(self.theta)?,
            vega: finite(self.vega)?,
            rho: finite(self.rho).unwrap_or(0.0),
            second_order: None,
        })
    }
}

#[inline]
fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

// ── Canonical contract ──

/// A numeric quote field. Missing values read as 0 but keep `present = false`,
/// so "zero" and "not reported" stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QuoteField {
    pub value: f64,
    pub present: bool,
}

impl QuoteField {
    pub const ABSENT: QuoteField = QuoteField {
        value: 0.0,
        present: false,
    };

    #[inline]
    pub fn from_raw(v: Option<f64>) -> Self {
        match finite(v) {
            Some(value) => Self {
                value,
                present: true,
            },
            None => Self::ABSENT,
        }
    }

    #[inline]
    pub fn get(&self) -> Option<f64> {
        self.present.then_some(self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GreeksSource {
    Provider,
    Computed,
}

/// Canonical option contract. Produced by a normalization pass; a new pass
/// produces new values rather than mutating old ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub symbol: String,
    pub underlying: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub last: QuoteField,
    pub bid: QuoteField,
    pub ask: QuoteField,
    pub mid: QuoteField,
    pub volume: QuoteField,
    pub open_interest: QuoteField,
    pub implied_volatility: QuoteField,
    pub greeks: Option<GreeksResult>,
    pub greeks_source: Option<GreeksSource>,
    /// Underlying price the moneyness fields were derived from.
    pub underlying_price: f64,
    pub in_the_money: bool,
    /// S / K
    pub moneyness: f64,
    pub source: String,
}

impl OptionContract {
    /// Calendar years from `as_of` to expiration, floored at zero.
    #[inline]
    pub fn time_to_expiry(&self, as_of: NaiveDate) -> f64 {
        let days = (self.expiration - as_of).num_days().max(0);
        days as f64 / 365.0
    }

    /// Best available price for valuation: mid if quoted and positive, else last.
    pub fn reference_price(&self) -> Option<f64> {
        self.mid
            .get()
            .filter(|m| *m > 0.0)
            .or_else(|| self.last.get().filter(|l| *l > 0.0))
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.ask.get()? - self.bid.get()?)
    }
}

/// Fields carried by an OCC option symbol, e.g. `AAPL240119C00150000`.
#[derive(Debug, Clone, PartialEq)]
pub struct OccSymbol {
    pub root: String,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub strike: f64,
}

impl OccSymbol {
    /// Parses `ROOT` + `YYMMDD` + `C|P` + strike * 1000 as 8 digits. Roots may be
    /// space-padded, and a provider `O:` prefix is ignored.
    pub fn parse(symbol: &str) -> Option<Self> {
        let s = symbol.trim();
        let s = s.strip_prefix("O:").unwrap_or(s);
        if s.len() < 16 || !s.is_ascii() {
            return None;
        }

        let (root, tail) = s.split_at(s.len() - 15);
        let root = root.trim();
        if root.is_empty() {
            return None;
        }

        let expiration = NaiveDate::parse_from_str(&tail[..6], "%y%m%d").ok()?;
        let option_type = match &tail[6..7] {
            "C" => OptionType::Call,
            "P" => OptionType::Put,
            _ => return None,
        };
        let strike_digits = &tail[7..];
        if !strike_digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let strike = strike_digits.parse::<u64>().ok()? as f64 / 1000.0;

        Some(Self {
            root: root.to_string(),
            expiration,
            option_type,
            strike,
        })
    }

    pub fn format(&self) -> String {
        let flag = match self.option_type {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        };
        format!(
            "{}{}{}{:08}",
            self.root,
            self.expiration.format("%y%m%d"),
            flag,
            (self.strike * 1000.0).round() as u64
        )
    }
}
