use crate::errors::EngineResult;
use crate::models::normal::{norm_cdf, norm_pdf};
use crate::models::PricingModel;
use crate::state::{GreeksResult, OptionType, PricingInputs, SecondOrderGreeks};

const DAYS_PER_YEAR: f64 = 365.0;
const PERCENT: f64 = 100.0;

/// Years. Anything shorter (about 30 microseconds) is priced as expired:
/// sigma*sqrt(T) and T*sigma*sqrt(T) underflow long before T reaches zero.
pub const MIN_TIME_TO_EXPIRY: f64 = 1e-12;

/// Black-Scholes-Merton pricing for European options with a continuous dividend yield.
///
/// d1 = (ln(S/K) + (r - q + sigma^2/2)*T) / (sigma * sqrt(T))
/// d2 = d1 - sigma * sqrt(T)
///
/// call = S*e^(-qT)*Phi(d1) - K*e^(-rT)*Phi(d2)
/// put  = K*e^(-rT)*Phi(-d2) - S*e^(-qT)*Phi(-d1)
///
/// T = 0, and any T below `MIN_TIME_TO_EXPIRY`, is handled as its own branch
/// (intrinsic value, step-function delta), never by pushing T -> 0 through d1/d2.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlackScholes;

impl BlackScholes {
    pub fn new() -> Self {
        Self
    }
}

/// Terms shared by the price and every Greek. Stack-allocated, computed once.
#[derive(Debug, Clone, Copy)]
struct Terms {
    d1: f64,
    d2: f64,
    sqrt_t: f64,
    sigma_sqrt_t: f64,
    /// e^(-qT)
    div_df: f64,
    /// e^(-rT)
    rate_df: f64,
}

impl Terms {
    #[inline]
    fn new(p: &PricingInputs) -> Self {
        let t = p.time_to_expiry;
        let sqrt_t = t.sqrt();
        let sigma_sqrt_t = p.volatility * sqrt_t;
        let d1 = ((p.spot / p.strike).ln()
            + (p.rate - p.dividend_yield + 0.5 * p.volatility * p.volatility) * t)
            / sigma_sqrt_t;
        Self {
            d1,
            d2: d1 - sigma_sqrt_t,
            sqrt_t,
            sigma_sqrt_t,
            div_df: (-p.dividend_yield * t).exp(),
            rate_df: (-p.rate * t).exp(),
        }
    }
}

/// Delta at expiry: a step at the strike, half-way exactly at it.
#[inline]
fn expiry_delta(option_type: OptionType, spot: f64, strike: f64) -> f64 {
    let call_delta = if spot > strike {
        1.0
    } else if spot < strike {
        0.0
    } else {
        0.5
    };
    match option_type {
        OptionType::Call => call_delta,
        OptionType::Put => call_delta - 1.0,
    }
}

impl PricingModel for BlackScholes {
    #[inline]
    fn name(&self) -> &'static str {
        "Black-Scholes-Merton"
    }

    fn price(&self, p: &PricingInputs) -> EngineResult<f64> {
        p.validate()?;

        if p.time_to_expiry < MIN_TIME_TO_EXPIRY {
            return Ok(p.option_type.intrinsic(p.spot, p.strike));
        }

        let t = Terms::new(p);
        let forward_leg = p.spot * t.div_df;
        let strike_leg = p.strike * t.rate_df;

        let value = match p.option_type {
            OptionType::Call => forward_leg * norm_cdf(t.d1) - strike_leg * norm_cdf(t.d2),
            OptionType::Put => strike_leg * norm_cdf(-t.d2) - forward_leg * norm_cdf(-t.d1),
        };

        // Rounding can leave a deep OTM value a hair below zero.
        Ok(value.max(0.0))
    }

    fn greeks(&self, p: &PricingInputs) -> EngineResult<GreeksResult> {
        p.validate()?;

        if p.time_to_expiry < MIN_TIME_TO_EXPIRY {
            return Ok(GreeksResult {
                delta: expiry_delta(p.option_type, p.spot, p.strike),
                second_order: Some(SecondOrderGreeks::default()),
                ..GreeksResult::default()
            });
        }

        let t = Terms::new(p);
        let tau = p.time_to_expiry;
        let sigma = p.volatility;
        let pdf_d1 = norm_pdf(t.d1);

        // Shared pieces
        let gamma = t.div_df * pdf_d1 / (p.spot * t.sigma_sqrt_t);
        let vega_raw = p.spot * t.div_df * pdf_d1 * t.sqrt_t;
        let decay = -p.spot * t.div_df * pdf_d1 * sigma / (2.0 * t.sqrt_t);
        let charm_common = t.div_df * pdf_d1
            * (2.0 * (p.rate - p.dividend_yield) * tau - t.d2 * t.sigma_sqrt_t)
            / (2.0 * tau * t.sigma_sqrt_t);

        let (delta, theta_annual, rho_raw, charm_annual) = match p.option_type {
            OptionType::Call => {
                let nd1 = norm_cdf(t.d1);
                let nd2 = norm_cdf(t.d2);
                (
                    t.div_df * nd1,
                    decay - p.rate * p.strike * t.rate_df * nd2
                        + p.dividend_yield * p.spot * t.div_df * nd1,
                    p.strike * tau * t.rate_df * nd2,
                    p.dividend_yield * t.div_df * nd1 - charm_common,
                )
            }
            OptionType::Put => {
                let n_neg_d1 = norm_cdf(-t.d1);
                let n_neg_d2 = norm_cdf(-t.d2);
                (
                    -t.div_df * n_neg_d1,
                    decay + p.rate * p.strike * t.rate_df * n_neg_d2
                        - p.dividend_yield * p.spot * t.div_df * n_neg_d1,
                    -p.strike * tau * t.rate_df * n_neg_d2,
                    -p.dividend_yield * t.div_df * n_neg_d1 - charm_common,
                )
            }
        };

        let second_order = SecondOrderGreeks {
            vanna: -t.div_df * pdf_d1 * t.d2 / sigma,
            charm: charm_annual / DAYS_PER_YEAR,
            vomma: vega_raw * t.d1 * t.d2 / sigma,
            speed: -gamma / p.spot * (t.d1 / t.sigma_sqrt_t + 1.0),
        };

        Ok(GreeksResult {
            delta,
            gamma,
            theta: theta_annual / DAYS_PER_YEAR,
            vega: vega_raw / PERCENT,
            rho: rho_raw / PERCENT,
            second_order: Some(second_order),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;

    fn inputs(option_type: OptionType, spot: f64, strike: f64, t: f64, vol: f64, r: f64, q: f64) -> PricingInputs {
        PricingInputs::new(option_type, spot, strike, t, vol, r, q)
    }

    #[test]
    fn test_reference_call() {
        let bs = BlackScholes::new();
        let p = inputs(OptionType::Call, 100.0, 100.0, 0.25, 0.20, 0.05, 0.0);
        let price = bs.price(&p).unwrap();
        assert!((price - 4.614_997).abs() < 1e-5, "reference call price={price}");

        let g = bs.greeks(&p).unwrap();
        // d1 = 0.175 for these inputs, so delta = Phi(0.175)
        assert!((g.delta - 0.569_460_2).abs() < 1e-6, "delta={}", g.delta);
        assert!((g.gamma - 0.039_288_0).abs() < 1e-6, "gamma={}", g.gamma);
        assert!((g.vega - 0.196_440_0).abs() < 1e-6, "vega per vol point={}", g.vega);
        assert!((g.theta + 0.028_696_3).abs() < 1e-6, "theta per day={}", g.theta);
        assert!((g.rho - 0.130_827_6).abs() < 1e-6, "rho per rate point={}", g.rho);
    }

    #[test]
    fn test_put_call_parity() {
        let bs = BlackScholes::new();
        let cases = [
            (100.0, 100.0, 0.25, 0.20, 0.05, 0.0),
            (80.0, 120.0, 2.0, 0.55, 0.01, 0.03),
            (150.0, 90.0, 0.01, 0.10, -0.005, 0.0),
            (42.0, 40.0, 0.75, 0.35, 0.08, 0.02),
            (1000.0, 1300.0, 5.0, 0.9, 0.0, 0.05),
        ];
        for (s, k, t, v, r, q) in cases {
            let call = bs.price(&inputs(OptionType::Call, s, k, t, v, r, q)).unwrap();
            let put = bs.price(&inputs(OptionType::Put, s, k, t, v, r, q)).unwrap();
            let rhs = s * (-q * t).exp() - k * (-r * t).exp();
            assert!(
                (call - put - rhs).abs() < 1e-6,
                "parity broken for S={s} K={k} T={t}: call-put={} rhs={rhs}",
                call - put
            );
        }
    }

    #[test]
    fn test_expiry_is_intrinsic() {
        let bs = BlackScholes::new();
        let itm = inputs(OptionType::Call, 110.0, 100.0, 0.0, 0.3, 0.05, 0.0);
        assert_eq!(bs.price(&itm).unwrap(), 10.0);
        let otm_put = inputs(OptionType::Put, 110.0, 100.0, 0.0, 0.3, 0.05, 0.0);
        assert_eq!(bs.price(&otm_put).unwrap(), 0.0);
        let itm_put = inputs(OptionType::Put, 95.0, 100.0, 0.0, 0.3, 0.05, 0.0);
        assert_eq!(bs.price(&itm_put).unwrap(), 5.0);
    }

    #[test]
    fn test_expiry_delta_step() {
        let bs = BlackScholes::new();
        let delta = |s: f64| {
            bs.greeks(&inputs(OptionType::Call, s, 100.0, 0.0, 0.3, 0.05, 0.0))
                .unwrap()
        };
        assert_eq!(delta(101.0).delta, 1.0);
        assert_eq!(delta(99.0).delta, 0.0);
        let atm = delta(100.0);
        assert_eq!(atm.delta, 0.5);
        assert_eq!(atm.gamma, 0.0);
        assert_eq!(atm.theta, 0.0);
        assert_eq!(atm.vega, 0.0);
        assert_eq!(atm.rho, 0.0);
        assert_eq!(atm.second_order, Some(SecondOrderGreeks::default()));

        let put_atm = bs
            .greeks(&inputs(OptionType::Put, 100.0, 100.0, 0.0, 0.3, 0.05, 0.0))
            .unwrap();
        assert_eq!(put_atm.delta, -0.5);
    }

    #[test]
    fn test_vanishing_expiry_stays_finite() {
        let bs = BlackScholes::new();
        for t in [1e-300, 5e-324, 1e-13] {
            for (option_type, spot) in [(OptionType::Call, 110.0), (OptionType::Put, 90.0), (OptionType::Call, 100.0)] {
                let p = inputs(option_type, spot, 100.0, t, 0.2, 0.05, 0.01);
                let g = bs.greeks(&p).unwrap();
                let so = g.second_order.unwrap();
                for (name, v) in [
                    ("delta", g.delta),
                    ("gamma", g.gamma),
                    ("theta", g.theta),
                    ("vega", g.vega),
                    ("rho", g.rho),
                    ("vanna", so.vanna),
                    ("charm", so.charm),
                    ("vomma", so.vomma),
                    ("speed", so.speed),
                ] {
                    assert!(v.is_finite(), "{name} not finite at t={t:e}, spot={spot}: {v}");
                }
                assert_eq!(g.delta, expiry_delta(option_type, spot, 100.0));
                assert_eq!(bs.price(&p).unwrap(), option_type.intrinsic(spot, 100.0));
            }
        }

        // just above the cutoff the closed form is still used, and is finite
        let p = inputs(OptionType::Call, 110.0, 100.0, 1e-12, 0.2, 0.05, 0.01);
        let so = bs.greeks(&p).unwrap().second_order.unwrap();
        assert!(so.charm.is_finite() && so.speed.is_finite());
    }

    #[test]
    fn test_monotonic_in_vol() {
        let bs = BlackScholes::new();
        for option_type in [OptionType::Call, OptionType::Put] {
            let mut last = 0.0;
            for i in 1..60 {
                let vol = i as f64 * 0.05;
                let price = bs
                    .price(&inputs(option_type, 100.0, 110.0, 0.5, vol, 0.03, 0.01))
                    .unwrap();
                assert!(price > last, "{option_type} price not increasing in vol at {vol}");
                last = price;
            }
        }
    }

    #[test]
    fn test_monotonic_in_spot() {
        let bs = BlackScholes::new();
        let mut last_call = 0.0;
        let mut last_put = f64::INFINITY;
        for i in 1..100 {
            let spot = 50.0 + i as f64;
            let call = bs.price(&inputs(OptionType::Call, spot, 100.0, 0.5, 0.25, 0.02, 0.0)).unwrap();
            let put = bs.price(&inputs(OptionType::Put, spot, 100.0, 0.5, 0.25, 0.02, 0.0)).unwrap();
            assert!(call >= last_call, "call decreased at S={spot}");
            assert!(put <= last_put, "put increased at S={spot}");
            last_call = call;
            last_put = put;
        }
    }

    #[test]
    fn test_greeks_match_bumped_prices() {
        // Analytic Greeks against central differences of the price.
        let bs = BlackScholes::new();
        let base = inputs(OptionType::Put, 95.0, 100.0, 0.6, 0.3, 0.04, 0.02);
        let g = bs.greeks(&base).unwrap();
        let price = |p: PricingInputs| bs.price(&p).unwrap();

        let h = 0.01;
        let fd_delta = (price(base.with_spot(95.0 + h)) - price(base.with_spot(95.0 - h))) / (2.0 * h);
        assert!((g.delta - fd_delta).abs() < 1e-6, "delta {} vs fd {fd_delta}", g.delta);

        let fd_gamma = (price(base.with_spot(95.0 + h)) - 2.0 * price(base) + price(base.with_spot(95.0 - h))) / (h * h);
        assert!((g.gamma - fd_gamma).abs() < 1e-4, "gamma {} vs fd {fd_gamma}", g.gamma);

        let dv = 1e-4;
        let up = PricingInputs { volatility: 0.3 + dv, ..base };
        let dn = PricingInputs { volatility: 0.3 - dv, ..base };
        let fd_vega = (price(up) - price(dn)) / (2.0 * dv) / 100.0;
        assert!((g.vega - fd_vega).abs() < 1e-6, "vega {} vs fd {fd_vega}", g.vega);

        let dt = 1e-5;
        let fd_theta = -(price(base.with_time_to_expiry(0.6 + dt)) - price(base.with_time_to_expiry(0.6 - dt)))
            / (2.0 * dt) / 365.0;
        assert!((g.theta - fd_theta).abs() < 1e-6, "theta {} vs fd {fd_theta}", g.theta);

        let dr = 1e-5;
        let r_up = PricingInputs { rate: 0.04 + dr, ..base };
        let r_dn = PricingInputs { rate: 0.04 - dr, ..base };
        let fd_rho = (price(r_up) - price(r_dn)) / (2.0 * dr) / 100.0;
        assert!((g.rho - fd_rho).abs() < 1e-6, "rho {} vs fd {fd_rho}", g.rho);
    }

    #[test]
    fn test_second_order_match_bumped_greeks() {
        let bs = BlackScholes::new();
        let base = inputs(OptionType::Call, 105.0, 100.0, 0.4, 0.25, 0.03, 0.01);
        let so = bs.greeks(&base).unwrap().second_order.unwrap();
        let greeks = |p: PricingInputs| bs.greeks(&p).unwrap();

        let dv = 1e-5;
        let up = PricingInputs { volatility: 0.25 + dv, ..base };
        let dn = PricingInputs { volatility: 0.25 - dv, ..base };
        let fd_vanna = (greeks(up).delta - greeks(dn).delta) / (2.0 * dv);
        assert!((so.vanna - fd_vanna).abs() < 1e-5, "vanna {} vs fd {fd_vanna}", so.vanna);
        // vega is reported per vol point, so undo the /100 before differencing
        let fd_vomma = (greeks(up).vega - greeks(dn).vega) * 100.0 / (2.0 * dv);
        assert!((so.vomma - fd_vomma).abs() < 1e-3, "vomma {} vs fd {fd_vomma}", so.vomma);

        let h = 1e-3;
        let fd_speed = (greeks(base.with_spot(105.0 + h)).gamma - greeks(base.with_spot(105.0 - h)).gamma) / (2.0 * h);
        assert!((so.speed - fd_speed).abs() < 1e-6, "speed {} vs fd {fd_speed}", so.speed);

        let dt = 1e-6;
        let fd_charm = -(greeks(base.with_time_to_expiry(0.4 + dt)).delta - greeks(base.with_time_to_expiry(0.4 - dt)).delta)
            / (2.0 * dt) / 365.0;
        assert!((so.charm - fd_charm).abs() < 1e-6, "charm {} vs fd {fd_charm}", so.charm);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let bs = BlackScholes::new();
        let bad_spot = inputs(OptionType::Call, 0.0, 100.0, 0.5, 0.2, 0.0, 0.0);
        assert!(matches!(
            bs.price(&bad_spot),
            Err(EngineError::InvalidInput { field: "spot", .. })
        ));
        let bad_t = inputs(OptionType::Call, 100.0, 100.0, -0.1, 0.2, 0.0, 0.0);
        assert!(matches!(
            bs.greeks(&bad_t),
            Err(EngineError::InvalidInput { field: "time_to_expiry", .. })
        ));
        let bad_q = inputs(OptionType::Put, 100.0, 100.0, 0.5, 0.2, 0.0, -0.01);
        assert!(matches!(
            bs.price(&bad_q),
            Err(EngineError::InvalidInput { field: "dividend_yield", .. })
        ));
    }
}
