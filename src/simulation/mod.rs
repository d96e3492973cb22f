pub mod monte_carlo;

pub use monte_carlo::{
    simulate_async, CancelToken, MonteCarloSimulator, PercentileOutcome, SimulationConfig,
    SimulationParams, SimulationRequest, SimulationResult,
};
