use crate::errors::{require_positive, EngineError, EngineResult};
use crate::state::{PriceBar, VolMethod, VolatilityEstimate};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Trading days per year used to annualize daily volatility.
const TRADING_DAYS: f64 = 252.0;

/// EWMA decay factor (lambda = 0.94 is the RiskMetrics daily standard)
const EWMA_LAMBDA: f64 = 0.94;

/// Sample standard deviation needs at least two returns.
const MIN_WINDOW: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalVolConfig {
    /// Default trailing windows, in trading days.
    pub windows: Vec<usize>,
    pub trading_days: f64,
    pub ewma_lambda: f64,
}

impl Default for HistoricalVolConfig {
    fn default() -> Self {
        Self {
            windows: vec![10, 20, 30, 60, 90],
            trading_days: TRADING_DAYS,
            ewma_lambda: EWMA_LAMBDA,
        }
    }
}

impl HistoricalVolConfig {
    pub fn validate(&self) -> EngineResult<()> {
        validate_windows(&self.windows)?;
        require_positive("trading_days", self.trading_days)?;
        if !(self.ewma_lambda > 0.0 && self.ewma_lambda < 1.0) {
            return Err(EngineError::invalid(
                "ewma_lambda",
                format!("must lie in (0, 1), got {}", self.ewma_lambda),
            ));
        }
        Ok(())
    }
}

/// Realized volatility from a daily bar series.
///
/// Window policy: a window that the series is too short for is left out of
/// the result. Only when *no* requested window can be estimated does the call
/// fail with `InsufficientData`.
///
/// Bars must already be ascending by date. The estimator never sorts; it
/// fails with `UnorderedData` at the first bar dated before its predecessor.
#[derive(Debug, Clone, Default)]
pub struct HistoricalVolEstimator {
    config: HistoricalVolConfig,
}

impl HistoricalVolEstimator {
    pub fn new(config: HistoricalVolConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HistoricalVolConfig {
        &self.config
    }

    /// Close-to-close estimate for each window: stdev (n-1) of the trailing
    /// `w` log returns, times sqrt(trading days).
    pub fn estimate(&self, bars: &[PriceBar], windows: &[usize]) -> EngineResult<Vec<VolatilityEstimate>> {
        validate_windows(windows)?;
        let returns = log_returns(bars)?;
        let annualize = self.config.trading_days.sqrt();

        let mut out = Vec::with_capacity(windows.len());
        for &w in windows {
            if returns.len() < w {
                tracing::debug!(window = w, available = bars.len(), "skipping window, series too short");
                continue;
            }
            let daily = variance_of_last(&returns, w).sqrt();
            out.push(VolatilityEstimate {
                window: w,
                volatility: daily * annualize,
                sample_count: w,
                method: VolMethod::CloseToClose,
            });
        }

        if out.is_empty() {
            return Err(insufficient(windows, 1, bars.len()));
        }
        Ok(out)
    }

    /// Estimates for the configured default windows.
    pub fn estimate_default(&self, bars: &[PriceBar]) -> EngineResult<Vec<VolatilityEstimate>> {
        self.estimate(bars, &self.config.windows)
    }

    /// Parkinson high/low range estimator over the trailing `w` bars.
    ///
    /// sigma^2 = sum(ln(H/L)^2) / (4 * ln 2 * w)
    pub fn parkinson(&self, bars: &[PriceBar], windows: &[usize]) -> EngineResult<Vec<VolatilityEstimate>> {
        validate_windows(windows)?;
        validate_series(bars)?;
        for bar in bars {
            require_positive("low", bar.low)?;
            if bar.high < bar.low {
                return Err(EngineError::invalid(
                    "high",
                    format!("below low on {}", bar.date),
                ));
            }
        }

        let annualize = self.config.trading_days.sqrt();
        let mut out = Vec::with_capacity(windows.len());
        for &w in windows {
            if bars.len() < w {
                tracing::debug!(window = w, available = bars.len(), "skipping parkinson window");
                continue;
            }
            let sum_sq: f64 = bars[bars.len() - w..]
                .iter()
                .map(|b| {
                    let range = (b.high / b.low).ln();
                    range * range
                })
                .sum();
            let daily = (sum_sq / (4.0 * std::f64::consts::LN_2 * w as f64)).sqrt();
            out.push(VolatilityEstimate {
                window: w,
                volatility: daily * annualize,
                sample_count: w,
                method: VolMethod::Parkinson,
            });
        }

        if out.is_empty() {
            return Err(insufficient(windows, 0, bars.len()));
        }
        Ok(out)
    }

    /// Exponentially weighted volatility over the whole series.
    /// Seeded with the first squared return, then
    /// var_t = lambda * var_{t-1} + (1 - lambda) * r_t^2.
    pub fn ewma(&self, bars: &[PriceBar]) -> EngineResult<VolatilityEstimate> {
        let returns = log_returns(bars)?;
        if returns.len() < MIN_WINDOW {
            return Err(EngineError::InsufficientData {
                required: MIN_WINDOW + 1,
                available: bars.len(),
            });
        }

        let lambda = self.config.ewma_lambda;
        let mut var = returns[0] * returns[0];
        for r in &returns[1..] {
            var = lambda * var + (1.0 - lambda) * r * r;
        }

        Ok(VolatilityEstimate {
            window: returns.len(),
            volatility: var.sqrt() * self.config.trading_days.sqrt(),
            sample_count: returns.len(),
            method: VolMethod::Ewma,
        })
    }

    /// Close-to-close volatility for every date that has a full window behind it.
    pub fn rolling(&self, bars: &[PriceBar], window: usize) -> EngineResult<Vec<(NaiveDate, f64)>> {
        validate_windows(&[window])?;
        let returns = log_returns(bars)?;
        if returns.len() < window {
            return Err(EngineError::InsufficientData {
                required: window + 1,
                available: bars.len(),
            });
        }

        let annualize = self.config.trading_days.sqrt();
        // returns[i] ends on bars[i + 1]
        Ok((window..=returns.len())
            .map(|end| {
                let daily = variance_of_last(&returns[..end], window).sqrt();
                (bars[end].date, daily * annualize)
            })
            .collect())
    }
}

/// Daily log returns ln(close_i / close_{i-1}) after order and positivity checks.
pub fn log_returns(bars: &[PriceBar]) -> EngineResult<Vec<f64>> {
    validate_series(bars)?;
    for bar in bars {
        require_positive("close", bar.close)?;
    }
    Ok(bars
        .windows(2)
        .map(|pair| (pair[1].close / pair[0].close).ln())
        .collect())
}

fn validate_series(bars: &[PriceBar]) -> EngineResult<()> {
    if let Some(i) = (1..bars.len()).find(|&i| bars[i].date < bars[i - 1].date) {
        tracing::warn!(index = i, date = %bars[i].date, "price bars out of order");
        return Err(EngineError::UnorderedData { index: i });
    }
    Ok(())
}

fn validate_windows(windows: &[usize]) -> EngineResult<()> {
    if windows.is_empty() {
        return Err(EngineError::invalid("windows", "at least one window is required"));
    }
    if let Some(w) = windows.iter().find(|&&w| w < MIN_WINDOW) {
        return Err(EngineError::invalid(
            "windows",
            format!("window {w} is below the minimum of {MIN_WINDOW}"),
        ));
    }
    Ok(())
}

/// `extra` is how many bars beyond the window length the method needs.
fn insufficient(windows: &[usize], extra: usize, available: usize) -> EngineError {
    let smallest = windows.iter().copied().min().unwrap_or(MIN_WINDOW);
    EngineError::InsufficientData {
        required: smallest + extra,
        available,
    }
}

/// Sample variance (n-1) of the last `window` elements. No allocation.
#[inline]
fn variance_of_last(data: &[f64], window: usize) -> f64 {
    let n = data.len().min(window);
    if n < 2 {
        return 0.0;
    }

    let tail = &data[data.len() - n..];
    let nf = n as f64;
    let mean = tail.iter().sum::<f64>() / nf;

    let var_sum: f64 = tail.iter().map(|r| (r - mean) * (r - mean)).sum();
    var_sum / (nf - 1.0)
}
