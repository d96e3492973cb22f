use crate::chain::normalizer::{compute_missing_greeks, fill_implied_vols, sort_chain, ChainNormalizer};
use crate::chain::types::{OptionContract, RawContract};
use crate::errors::{EngineError, EngineResult};
use crate::models::implied_vol::{ImpliedVolSolver, NoArbitrageBounds};
use crate::models::volatility::HistoricalVolEstimator;
use crate::simulation::{simulate_async, CancelToken, SimulationRequest, SimulationResult};
use crate::state::{AppState, GreeksResult, MarketInputs, PerfCounters, PriceBar, PricingInputs, VolMethod, VolatilityEstimate};
use crate::strategy::payoff::{lognormal_spot_range, spot_grid, summarize, LegInstrument, PayoffPoint, PayoffSummary, StrategyEngine, StrategyLeg};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Grid size when a payoff request names neither spots nor a step count.
const DEFAULT_GRID_STEPS: usize = 101;

/// Coverage of the default payoff x-axis.
const DEFAULT_RANGE_CONFIDENCE: f64 = 0.99;

type ApiResult<T> = Result<Json<T>, EngineError>;

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidInput { .. }
            | EngineError::NoConvergence { .. }
            | EngineError::ArbitrageViolation { .. }
            | EngineError::InsufficientData { .. }
            | EngineError::UnorderedData { .. }
            | EngineError::UnsupportedContractType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            EngineError::Config(_) | EngineError::TaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}

/// Wraps an engine result for the wire and counts failures.
fn respond<T>(state: &AppState, result: EngineResult<T>) -> ApiResult<T> {
    result.map(Json).map_err(|e| {
        PerfCounters::bump(&state.counters.errors_returned);
        tracing::debug!(kind = e.kind(), error = %e, "request failed");
        e
    })
}

// ── Pricing ──

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub model: &'static str,
    pub price: f64,
    pub greeks: GreeksResult,
}

/// POST /api/price -- fair value and Greeks for one option
pub async fn post_price(
    State(state): State<Arc<AppState>>,
    Json(inputs): Json<PricingInputs>,
) -> ApiResult<PriceResponse> {
    PerfCounters::bump(&state.counters.price_requests);
    let model = state.model.as_ref();
    let result = model.price(&inputs).and_then(|price| {
        Ok(PriceResponse {
            model: model.name(),
            price,
            greeks: model.greeks(&inputs)?,
        })
    });
    respond(&state, result)
}

#[derive(Debug, Deserialize)]
pub struct ImpliedVolRequest {
    pub price: f64,
    #[serde(flatten)]
    pub market: MarketInputs,
}

#[derive(Debug, Serialize)]
pub struct ImpliedVolResponse {
    pub implied_volatility: f64,
    pub bounds: NoArbitrageBounds,
}

/// POST /api/implied-vol -- volatility implied by an observed price
pub async fn post_implied_vol(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImpliedVolRequest>,
) -> ApiResult<ImpliedVolResponse> {
    PerfCounters::bump(&state.counters.implied_vol_requests);
    let result = ImpliedVolSolver::new(state.model.as_ref(), state.config.solver)
        .and_then(|solver| solver.solve(req.price, &req.market))
        .map(|iv| ImpliedVolResponse {
            implied_volatility: iv,
            bounds: NoArbitrageBounds::for_market(&req.market),
        });
    respond(&state, result)
}

// ── Historical volatility ──

#[derive(Debug, Deserialize)]
pub struct HistoricalVolRequest {
    pub bars: Vec<PriceBar>,
    /// Falls back to the configured windows.
    #[serde(default)]
    pub windows: Option<Vec<usize>>,
    #[serde(default)]
    pub method: Option<VolMethod>,
    /// Adds a full-series rolling close-to-close curve of this window.
    #[serde(default)]
    pub rolling_window: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RollingPoint {
    pub date: NaiveDate,
    pub volatility: f64,
}

#[derive(Debug, Serialize)]
pub struct HistoricalVolResponse {
    pub estimates: Vec<VolatilityEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling: Option<Vec<RollingPoint>>,
}

/// POST /api/historical-vol -- realized volatility over trailing windows
pub async fn post_historical_vol(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HistoricalVolRequest>,
) -> ApiResult<HistoricalVolResponse> {
    PerfCounters::bump(&state.counters.historical_vol_requests);
    let result = HistoricalVolEstimator::new(state.config.historical_vol.clone())
        .and_then(|estimator| historical_vol(&estimator, &req));
    respond(&state, result)
}

fn historical_vol(estimator: &HistoricalVolEstimator, req: &HistoricalVolRequest) -> EngineResult<HistoricalVolResponse> {
    let windows = req
        .windows
        .as_deref()
        .unwrap_or(estimator.config().windows.as_slice());
    let estimates = match req.method.unwrap_or(VolMethod::CloseToClose) {
        VolMethod::CloseToClose => estimator.estimate(&req.bars, windows)?,
        VolMethod::Parkinson => estimator.parkinson(&req.bars, windows)?,
        VolMethod::Ewma => vec![estimator.ewma(&req.bars)?],
    };
    let rolling = match req.rolling_window {
        Some(w) => Some(
            estimator
                .rolling(&req.bars, w)?
                .into_iter()
                .map(|(date, volatility)| RollingPoint { date, volatility })
                .collect(),
        ),
        None => None,
    };
    Ok(HistoricalVolResponse { estimates, rolling })
}

// ── Chains ──

#[derive(Debug, Deserialize)]
pub struct ChainRequest {
    pub contracts: Vec<RawContract>,
    pub underlying_price: f64,
    #[serde(default)]
    pub source: Option<String>,
    /// Valuation date for time-to-expiry; today (UTC) when absent.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub dividend_yield: f64,
    #[serde(default)]
    pub fill_implied_vols: bool,
    #[serde(default)]
    pub compute_greeks: bool,
}

#[derive(Debug, Serialize)]
pub struct RejectedContract {
    pub index: usize,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ChainResponse {
    pub contracts: Vec<OptionContract>,
    pub rejected: Vec<RejectedContract>,
}

/// POST /api/chain/normalize -- canonical, sorted chain plus per-record rejections
pub async fn post_normalize_chain(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChainRequest>,
) -> ApiResult<ChainResponse> {
    PerfCounters::bump(&state.counters.chain_requests);
    let result = normalize_chain(&state, req);
    respond(&state, result)
}

fn normalize_chain(state: &AppState, req: ChainRequest) -> EngineResult<ChainResponse> {
    let normalizer = ChainNormalizer::new(req.source.unwrap_or_else(|| "api".to_string()));
    let (mut contracts, rejected) = normalizer.normalize_partial(&req.contracts, req.underlying_price)?;
    let as_of = req.as_of.unwrap_or_else(|| chrono::Utc::now().date_naive());

    if req.fill_implied_vols {
        let solver = ImpliedVolSolver::new(state.model.as_ref(), state.config.solver)?;
        contracts = fill_implied_vols(&contracts, &solver, as_of, req.rate, req.dividend_yield);
    }
    if req.compute_greeks {
        contracts = compute_missing_greeks(contracts, as_of, req.rate, req.dividend_yield, state.model.as_ref())?;
    }
    sort_chain(&mut contracts);

    Ok(ChainResponse {
        contracts,
        rejected: rejected
            .into_iter()
            .map(|(index, e)| RejectedContract {
                index,
                kind: e.kind(),
                error: e.to_string(),
            })
            .collect(),
    })
}

// ── Strategies ──

fn default_at_expiry() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PayoffRequest {
    pub legs: Vec<StrategyLeg>,
    /// Explicit spots; otherwise a grid from `lower`/`upper`, otherwise a
    /// lognormal range around the first option leg.
    #[serde(default)]
    pub spots: Option<Vec<f64>>,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default = "default_at_expiry")]
    pub at_expiry: bool,
    /// Years elapsed; takes precedence over `at_expiry`.
    #[serde(default)]
    pub elapsed: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PayoffResponse {
    pub curve: Vec<PayoffPoint>,
    pub summary: PayoffSummary,
    pub greeks: GreeksResult,
}

/// POST /api/strategy/payoff -- payoff diagram data for a multi-leg position
pub async fn post_payoff(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PayoffRequest>,
) -> ApiResult<PayoffResponse> {
    PerfCounters::bump(&state.counters.payoff_requests);
    let result = payoff(&StrategyEngine::new(state.model.as_ref()), &req);
    respond(&state, result)
}

fn payoff(engine: &StrategyEngine<'_>, req: &PayoffRequest) -> EngineResult<PayoffResponse> {
    let spots = payoff_spots(req)?;
    let curve = match req.elapsed {
        Some(elapsed) => engine.value_at_horizon(&req.legs, &spots, elapsed)?,
        None => engine.payoff_curve(&req.legs, &spots, req.at_expiry)?,
    };
    Ok(PayoffResponse {
        summary: summarize(&curve)?,
        greeks: engine.position_greeks(&req.legs)?,
        curve,
    })
}

fn payoff_spots(req: &PayoffRequest) -> EngineResult<Vec<f64>> {
    if let Some(spots) = &req.spots {
        return Ok(spots.clone());
    }
    let steps = req.steps.unwrap_or(DEFAULT_GRID_STEPS);
    if let (Some(lower), Some(upper)) = (req.lower, req.upper) {
        return spot_grid(lower, upper, steps);
    }

    let reference = req.legs.iter().find_map(|leg| match leg.instrument {
        LegInstrument::Option(inputs) => Some(inputs),
        LegInstrument::Underlying => None,
    });
    let longest = req
        .legs
        .iter()
        .filter_map(StrategyLeg::time_to_expiry)
        .fold(0.0, f64::max);
    match reference {
        Some(inputs) if longest > 0.0 => {
            let (lower, upper) = lognormal_spot_range(inputs.spot, inputs.volatility, longest, DEFAULT_RANGE_CONFIDENCE)?;
            // keep every strike on the chart
            let (lower, upper) = req.legs.iter().fold((lower, upper), |(lo, hi), leg| match leg.instrument {
                LegInstrument::Option(o) => (lo.min(o.strike * 0.9), hi.max(o.strike * 1.1)),
                LegInstrument::Underlying => (lo, hi),
            });
            spot_grid(lower, upper, steps)
        }
        _ => Err(EngineError::invalid("spots", "give spots, or lower and upper, for this strategy")),
    }
}

/// Cancels a running simulation if the request future is dropped before it
/// finishes, which is what happens when the client goes away.
struct DisconnectGuard {
    cancel: CancelToken,
    state: Arc<AppState>,
    armed: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cancel.cancel();
            PerfCounters::bump(&self.state.counters.simulations_cancelled);
            tracing::info!("client went away, simulation cancelled");
        }
    }
}

/// POST /api/strategy/simulate -- Monte Carlo P&L distribution (blocking pool)
pub async fn post_simulate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SimulationRequest>,
) -> ApiResult<SimulationResult> {
    PerfCounters::bump(&state.counters.simulations_started);
    let cancel = CancelToken::new();
    let mut guard = DisconnectGuard {
        cancel: cancel.clone(),
        state: state.clone(),
        armed: true,
    };
    let result = simulate_async(state.model.clone(), state.config.simulation.clone(), req, cancel).await;
    guard.armed = false;
    respond(&state, result)
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    use portable_atomic::Ordering::Relaxed;
    let c = &state.counters;
    Json(serde_json::json!({
        "price_requests": c.price_requests.load(Relaxed),
        "implied_vol_requests": c.implied_vol_requests.load(Relaxed),
        "historical_vol_requests": c.historical_vol_requests.load(Relaxed),
        "chain_requests": c.chain_requests.load(Relaxed),
        "payoff_requests": c.payoff_requests.load(Relaxed),
        "simulations_started": c.simulations_started.load(Relaxed),
        "simulations_cancelled": c.simulations_cancelled.load(Relaxed),
        "errors_returned": c.errors_returned.load(Relaxed),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::OptionType;
    use portable_atomic::Ordering::Relaxed;

    fn app() -> Arc<AppState> {
        AppState::new(AppConfig::default())
    }

    fn atm_call() -> PricingInputs {
        PricingInputs::new(OptionType::Call, 100.0, 100.0, 0.25, 0.2, 0.05, 0.0)
    }

    #[tokio::test]
    async fn test_price_reference_value() {
        let state = app();
        let Json(resp) = post_price(State(state.clone()), Json(atm_call())).await.unwrap();
        assert!((resp.price - 4.614_997).abs() < 1e-5, "price={}", resp.price);
        assert_eq!(resp.model, "Black-Scholes-Merton");
        assert!(resp.greeks.second_order.is_some());
        assert_eq!(state.counters.price_requests.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn test_error_status_and_counter() {
        let state = app();
        let bad = PricingInputs { spot: -1.0, ..atm_call() };
        let err = post_price(State(state.clone()), Json(bad)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(state.counters.errors_returned.load(Relaxed), 1);

        assert_eq!(EngineError::Cancelled.into_response().status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            EngineError::TaskFailed("panicked".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_implied_vol_request_shape() {
        let state = app();
        let req: ImpliedVolRequest = serde_json::from_value(serde_json::json!({
            "price": 4.614997129602855,
            "option_type": "call",
            "spot": 100.0,
            "strike": 100.0,
            "time_to_expiry": 0.25,
            "rate": 0.05
        }))
        .unwrap();
        let Json(resp) = post_implied_vol(State(state), Json(req)).await.unwrap();
        assert!((resp.implied_volatility - 0.2).abs() < 1e-4);
        assert!(resp.bounds.upper > resp.bounds.lower);
    }

    #[tokio::test]
    async fn test_historical_vol_with_rolling_curve() {
        let state = app();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut close = 100.0_f64;
        let bars: Vec<PriceBar> = (0..21)
            .map(|i| {
                if i > 0 {
                    close *= if i % 2 == 1 { 0.01_f64.exp() } else { (-0.01_f64).exp() };
                }
                PriceBar {
                    date: start + chrono::Days::new(i),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 0.0,
                }
            })
            .collect();
        let req = HistoricalVolRequest {
            bars,
            windows: Some(vec![20, 60]),
            method: None,
            rolling_window: Some(10),
        };
        let Json(resp) = post_historical_vol(State(state), Json(req)).await.unwrap();
        assert_eq!(resp.estimates.len(), 1, "60-day window is omitted");
        assert!((resp.estimates[0].volatility - 0.162_869_014_209_191_1).abs() < 1e-12);
        assert_eq!(resp.rolling.map(|r| r.len()), Some(11));
    }

    #[tokio::test]
    async fn test_chain_keeps_good_records() {
        let state = app();
        let req: ChainRequest = serde_json::from_value(serde_json::json!({
            "underlying_price": 100.0,
            "as_of": "2025-03-20",
            "rate": 0.03,
            "compute_greeks": true,
            "contracts": [
                {"underlying": "XYZ", "type": "put", "strike": 95, "expiry": "2025-06-20", "iv": 0.3},
                {"underlying": "XYZ", "type": "swap", "strike": 95, "expiry": "2025-06-20"},
                {"underlying": "XYZ", "type": "call", "strike": 95, "expiry": "2025-06-20", "bid": 7.0, "ask": 7.4}
            ]
        }))
        .unwrap();
        let Json(resp) = post_normalize_chain(State(state), Json(req)).await.unwrap();
        assert_eq!(resp.contracts.len(), 2);
        assert_eq!(resp.contracts[0].option_type, OptionType::Call, "sorted calls first");
        assert!(resp.contracts[1].greeks.is_some(), "computed from iv");
        assert!(resp.contracts[0].greeks.is_none(), "no iv, no greeks");
        assert_eq!(resp.rejected.len(), 1);
        assert_eq!(resp.rejected[0].index, 1);
        assert_eq!(resp.rejected[0].kind, "unsupported_contract_type");
    }

    #[tokio::test]
    async fn test_payoff_default_grid_covers_strikes() {
        let state = app();
        let req = PayoffRequest {
            legs: vec![
                StrategyLeg::option(atm_call(), 1.0, 4.6),
                StrategyLeg::option(PricingInputs { strike: 140.0, ..atm_call() }, -1.0, 0.1),
            ],
            spots: None,
            lower: None,
            upper: None,
            steps: None,
            at_expiry: true,
            elapsed: None,
        };
        let Json(resp) = post_payoff(State(state), Json(req)).await.unwrap();
        assert_eq!(resp.curve.len(), DEFAULT_GRID_STEPS);
        let last = resp.curve.last().unwrap();
        assert!(last.spot >= 154.0, "grid reaches past the short strike, got {}", last.spot);
        assert!((resp.summary.max_profit - 35.5).abs() < 1e-9);
        assert!((resp.summary.max_loss + 4.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_payoff_stock_only_needs_spots() {
        let state = app();
        let req = PayoffRequest {
            legs: vec![StrategyLeg::underlying(1.0, 100.0)],
            spots: None,
            lower: None,
            upper: None,
            steps: None,
            at_expiry: true,
            elapsed: None,
        };
        let err = post_payoff(State(state), Json(req)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { field: "spots", .. }));
    }

    #[tokio::test]
    async fn test_simulate_seeded() {
        let state = app();
        let req: SimulationRequest = serde_json::from_value(serde_json::json!({
            "legs": [{
                "instrument": {"kind": "option", "option_type": "put", "spot": 100.0, "strike": 95.0,
                               "time_to_expiry": 0.25, "volatility": 0.25, "rate": 0.03},
                "quantity": -1.0,
                "entry_price": 2.0
            }],
            "params": {"spot": 100.0, "volatility": 0.25, "rate": 0.03},
            "path_count": 5000,
            "seed": 17
        }))
        .unwrap();
        let Json(a) = post_simulate(State(state.clone()), Json(req.clone())).await.unwrap();
        let Json(b) = post_simulate(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.max, 2.0, "short put keeps at most its premium");
        assert_eq!(state.counters.simulations_started.load(Relaxed), 2);
        assert_eq!(state.counters.simulations_cancelled.load(Relaxed), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_cancels() {
        let state = app();
        let cancel = CancelToken::new();
        {
            let _guard = DisconnectGuard {
                cancel: cancel.clone(),
                state: state.clone(),
                armed: true,
            };
        }
        assert!(cancel.is_cancelled());
        assert_eq!(state.counters.simulations_cancelled.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn test_counters_snapshot() {
        let state = app();
        let _ = post_price(State(state.clone()), Json(atm_call())).await;
        let Json(v) = get_counters(State(state)).await;
        assert_eq!(v["price_requests"], 1);
        assert_eq!(v["errors_returned"], 0);
    }
}
