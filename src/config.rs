use crate::errors::{EngineError, EngineResult};
use crate::models::implied_vol::SolverConfig;
use crate::models::volatility::HistoricalVolConfig;
use crate::simulation::monte_carlo::SimulationConfig;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_port: u16,
    pub solver: SolverConfig,
    pub historical_vol: HistoricalVolConfig,
    pub simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_port: 3001,
            solver: SolverConfig::default(),
            historical_vol: HistoricalVolConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let server_port = vars.parse::<u16>("SERVER_PORT", "3001")?;

        let solver = SolverConfig {
            tolerance: vars.parse("IV_TOLERANCE", "1e-7")?,
            max_iterations: vars.parse("IV_MAX_ITERATIONS", "100")?,
            vol_lower: vars.parse("IV_VOL_LOWER", "0.001")?,
            vol_upper: vars.parse("IV_VOL_UPPER", "5.0")?,
        };
        solver.validate().map_err(|e| as_config_error("IV_", e))?;

        let historical_vol = HistoricalVolConfig {
            windows: vars.parse_list("HV_WINDOWS", "10,20,30,60,90")?,
            trading_days: vars.parse("HV_TRADING_DAYS", "252")?,
            ewma_lambda: vars.parse("HV_EWMA_LAMBDA", "0.94")?,
        };
        historical_vol
            .validate()
            .map_err(|e| as_config_error("HV_", e))?;

        let simulation = SimulationConfig {
            default_paths: vars.parse("MC_DEFAULT_PATHS", "10000")?,
            max_paths: vars.parse("MC_MAX_PATHS", "1000000")?,
            percentiles: vars.parse_list("MC_PERCENTILES", "0.05,0.25,0.5,0.75,0.95")?,
        };
        if simulation
            .percentiles
            .iter()
            .any(|p| !(0.0..=1.0).contains(p))
        {
            return Err(EngineError::Config(
                "MC_PERCENTILES: values must lie in [0, 1]".into(),
            ));
        }
        if simulation.default_paths == 0 || simulation.default_paths > simulation.max_paths {
            return Err(EngineError::Config(format!(
                "MC_DEFAULT_PATHS: need 1..={}, got {}",
                simulation.max_paths, simulation.default_paths
            )));
        }

        Ok(Self {
            server_port,
            solver,
            historical_vol,
            simulation,
        })
    }
}

/// Names the offending variable: field `vol_lower` under prefix `IV_` is `IV_VOL_LOWER`.
fn as_config_error(prefix: &str, e: EngineError) -> EngineError {
    match e {
        EngineError::InvalidInput { field, reason } => {
            EngineError::Config(format!("{prefix}{}: {reason}", field.to_uppercase()))
        }
        other => EngineError::Config(format!("{prefix}*: {other}")),
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn var_or(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: &str) -> EngineResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.var_or(key, default)
            .trim()
            .parse::<T>()
            .map_err(|e| EngineError::Config(format!("{key}: {e}")))
    }

    fn parse_list<T>(&self, key: &str, default: &str) -> EngineResult<Vec<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.var_or(key, default)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<T>()
                    .map_err(|e| EngineError::Config(format!("{key}: {s}: {e}")))
            })
            .collect()
    }
}
