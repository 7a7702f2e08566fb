//! Cost computation
//!
//! Pure arithmetic over a pricing descriptor and a usage report. When a
//! provider reports its own cost that figure wins; otherwise the linear
//! formula here is authoritative.

use crate::types::{ModelPricing, TokenUsage};

/// Cost of a completed request in USD
pub fn compute_cost(pricing: &ModelPricing, usage: &TokenUsage) -> f64 {
    let mut cost = usage.input_tokens as f64 * pricing.input_price
        + usage.output_tokens as f64 * pricing.output_price;
    if let Some(price) = pricing.reasoning_price {
        cost += usage.reasoning_tokens as f64 * price;
    }
    if let Some(price) = pricing.cached_input_price {
        cost += usage.cached_input_tokens as f64 * price;
    }
    if let Some(price) = pricing.multimodal_unit_price {
        cost += usage.multimodal_units as f64 * price;
    }
    cost
}

/// Preferred cost for the ledger: the provider's native figure when
/// supplied, the computed formula otherwise
pub fn effective_cost(pricing: &ModelPricing, usage: &TokenUsage, native_cost: Option<f64>) -> f64 {
    native_cost.unwrap_or_else(|| compute_cost(pricing, usage))
}

/// Cost estimate ahead of dispatch, used by cost-based routing
pub fn estimate_cost(pricing: &ModelPricing, input_tokens: u32, expected_output_tokens: u32) -> f64 {
    input_tokens as f64 * pricing.input_price
        + expected_output_tokens as f64 * pricing.output_price
}

/// Rough token count for a prompt when the caller supplies no estimate.
/// Four characters per token is the usual approximation.
pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> ModelPricing {
        ModelPricing {
            input_price: 0.000003,
            output_price: 0.000015,
            cached_input_price: Some(0.0000003),
            reasoning_price: Some(0.000015),
            multimodal_unit_price: None,
        }
    }

    #[test]
    fn cost_is_the_linear_formula() {
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            reasoning_tokens: 200,
            cached_input_tokens: 100,
            multimodal_units: 0,
        };
        let expected = 1000.0 * 0.000003
            + 500.0 * 0.000015
            + 200.0 * 0.000015
            + 100.0 * 0.0000003;
        assert!((compute_cost(&pricing(), &usage) - expected).abs() < 1e-12);
    }

    #[test]
    fn optional_prices_default_to_free() {
        let bare = ModelPricing::new(0.000003, 0.000015);
        let usage = TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 1_000_000,
            cached_input_tokens: 1_000_000,
            multimodal_units: 50,
        };
        assert_eq!(compute_cost(&bare, &usage), 0.0);
    }

    #[test]
    fn cost_is_non_negative_and_linear() {
        let pricing = pricing();
        assert_eq!(compute_cost(&pricing, &TokenUsage::default()), 0.0);

        let unit = TokenUsage::new(1, 0);
        let scaled = TokenUsage::new(1000, 0);
        let unit_cost = compute_cost(&pricing, &unit);
        let scaled_cost = compute_cost(&pricing, &scaled);
        assert!(unit_cost >= 0.0);
        assert!((scaled_cost - unit_cost * 1000.0).abs() < 1e-12);
    }

    #[test]
    fn native_cost_wins_when_present() {
        let usage = TokenUsage::new(1000, 1000);
        assert_eq!(effective_cost(&pricing(), &usage, Some(0.42)), 0.42);
        assert!(effective_cost(&pricing(), &usage, None) > 0.0);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
