//! Per-token pricing for known models (USD).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Look up `(input, output)` cost per token. Unknown models cost zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_lowercase();
    // Longest prefixes first: "gpt-4o-mini" must not match "gpt-4o" or "gpt-4".
    if model.starts_with("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if model.starts_with("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else if model.starts_with("gpt-4-turbo") {
        (dec!(0.00001), dec!(0.00003))
    } else if model.starts_with("gpt-4") {
        (dec!(0.00003), dec!(0.00006))
    } else if model.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if model.contains("sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if model.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt4_variants_resolve_distinctly() {
        assert_eq!(model_cost("gpt-4").0, dec!(0.00003));
        assert_eq!(model_cost("gpt-4o").0, dec!(0.0000025));
        assert_eq!(model_cost("gpt-4o-mini-2024-07-18").0, dec!(0.00000015));
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(model_cost("local-llama"), (Decimal::ZERO, Decimal::ZERO));
    }
}
