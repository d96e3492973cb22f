/// Domain-specific error types for the pricing engine.
/// Every error is local to a single call. The engine never retries and never
/// substitutes a default number for a failed computation; the host decides
/// whether to retry, surface a message, or fall back.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {field} {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("no convergence after {iterations} iterations (residual {residual:e})")]
    NoConvergence { iterations: u32, residual: f64 },

    #[error("price {price} outside no-arbitrage bounds [{lower}, {upper}]")]
    ArbitrageViolation { price: f64, lower: f64, upper: f64 },

    #[error("insufficient data: need {required} prices, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("unordered data: date at index {index} precedes the previous bar")]
    UnorderedData { index: usize },

    #[error("unsupported contract type: {0}")]
    UnsupportedContractType(String),

    #[error("simulation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Shorthand used by input validation throughout the engine.
    #[inline]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Stable tag for the variant, used by the host when serializing errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::NoConvergence { .. } => "no_convergence",
            Self::ArbitrageViolation { .. } => "arbitrage_violation",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::UnorderedData { .. } => "unordered_data",
            Self::UnsupportedContractType(_) => "unsupported_contract_type",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::TaskFailed(_) => "task_failed",
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::TaskFailed(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Fails with `InvalidInput` unless `value` is finite and strictly positive.
#[inline]
pub(crate) fn require_positive(field: &'static str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::invalid(field, format!("must be > 0, got {value}")));
    }
    Ok(())
}

/// Fails with `InvalidInput` unless `value` is finite and non-negative.
#[inline]
pub(crate) fn require_non_negative(field: &'static str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::invalid(field, format!("must be >= 0, got {value}")));
    }
    Ok(())
}

/// Fails with `InvalidInput` unless `value` is finite.
#[inline]
pub(crate) fn require_finite(field: &'static str, value: f64) -> EngineResult<()> {
    if !value.is_finite() {
        return Err(EngineError::invalid(field, format!("must be finite, got {value}")));
    }
    Ok(())
}
