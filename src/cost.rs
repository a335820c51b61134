//! Pure cost model: (provider rates, token counts) → money.
//!
//! No state, no I/O. The ledger reserves against the *estimate* produced
//! here and settles against the *actual* cost computed from returned token
//! counts, so estimation errs on the high side.

use rust_decimal::Decimal;

use crate::provider::{CompletionRequest, ProviderSpec};

/// Monetary cost of one invocation given real token counts.
pub fn invocation_cost(spec: &ProviderSpec, input_tokens: u64, output_tokens: u64) -> Decimal {
    Decimal::from(input_tokens) * spec.input_cost_per_token
        + Decimal::from(output_tokens) * spec.output_cost_per_token
}

/// Rough token count for a piece of text (1 token ≈ 4 characters).
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() + 3) / 4) as u64
}

/// Conservative upper-bound cost estimate for a request against `spec`.
///
/// Input tokens come from the prompt size heuristic; output tokens use the
/// request's `max_tokens` when present, else `output_allowance`. An
/// over-estimate is released at settle time; an under-estimate would risk
/// the budget invariant, so we round up.
pub fn estimate_request_cost(
    spec: &ProviderSpec,
    request: &CompletionRequest,
    output_allowance: u32,
) -> Decimal {
    let input_tokens = estimate_tokens(&request.prompt)
        + request
            .system_prompt
            .as_deref()
            .map(estimate_tokens)
            .unwrap_or(0);
    let output_tokens = u64::from(request.max_tokens.unwrap_or(output_allowance));
    invocation_cost(spec, input_tokens, output_tokens)
}

/// Combined per-token rate used to pick the cheapest candidate of a tier.
pub fn combined_rate(spec: &ProviderSpec) -> Decimal {
    spec.input_cost_per_token + spec.output_cost_per_token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::Tier;
    use rust_decimal_macros::dec;

    fn spec(input: Decimal, output: Decimal) -> ProviderSpec {
        ProviderSpec {
            name: "p".into(),
            tier: Tier::FAST,
            priority: 0,
            input_cost_per_token: input,
            output_cost_per_token: output,
            invoke_timeout: None,
            privacy_compatible: false,
        }
    }

    #[test]
    fn invocation_cost_is_linear_in_tokens() {
        let s = spec(dec!(0.000001), dec!(0.000002));
        assert_eq!(invocation_cost(&s, 1_000, 500), dec!(0.002));
        assert_eq!(invocation_cost(&s, 0, 0), Decimal::ZERO);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn estimate_uses_output_allowance_when_unbounded() {
        let s = spec(dec!(0.000001), dec!(0.000002));
        let req = CompletionRequest::new("abcd"); // 1 input token
        let est = estimate_request_cost(&s, &req, 1_000);
        assert_eq!(est, dec!(0.000001) + dec!(0.002));
    }

    #[test]
    fn estimate_prefers_request_max_tokens() {
        let s = spec(dec!(0.000001), dec!(0.000002));
        let mut req = CompletionRequest::new("abcd");
        req.max_tokens = Some(10);
        let est = estimate_request_cost(&s, &req, 1_000);
        assert_eq!(est, dec!(0.000001) + dec!(0.00002));
    }

    #[test]
    fn estimate_counts_system_prompt() {
        let s = spec(dec!(0.000001), Decimal::ZERO);
        let mut req = CompletionRequest::new("abcd");
        req.system_prompt = Some("abcdefgh".into()); // 2 tokens
        assert_eq!(estimate_request_cost(&s, &req, 0), dec!(0.000003));
    }
}
