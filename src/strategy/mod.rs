pub mod payoff;

pub use payoff::{LegInstrument, PayoffPoint, PayoffSummary, StrategyEngine, StrategyLeg};
