//! Token usage extraction and cost computation for completed dispatches.

use fm_core::types::Tier;

/// USD per million tokens, per tier: (input, output).
fn rates(tier: Tier) -> (f64, f64) {
    match tier {
        Tier::Fast => (0.25, 1.25),
        Tier::Balanced => (3.0, 15.0),
        Tier::Premium => (15.0, 75.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Parse the worker CLI's usage summary line from captured output.
///
/// Workers print a final line of the form
/// `tokens used: input=12345 output=678`; absent that, usage is zero and the
/// dispatch carries no cost.
pub fn parse_usage(output: &str) -> TokenUsage {
    for line in output.lines().rev() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("tokens used:") else {
            continue;
        };
        let mut usage = TokenUsage::default();
        for part in rest.split_whitespace() {
            if let Some(v) = part.strip_prefix("input=") {
                usage.input_tokens = v.parse().unwrap_or(0);
            } else if let Some(v) = part.strip_prefix("output=") {
                usage.output_tokens = v.parse().unwrap_or(0);
            }
        }
        return usage;
    }
    TokenUsage::default()
}

/// Dollar cost of a dispatch at the given tier.
pub fn cost_usd(tier: Tier, usage: TokenUsage) -> f64 {
    let (in_rate, out_rate) = rates(tier);
    (usage.input_tokens as f64 * in_rate + usage.output_tokens as f64 * out_rate) / 1_000_000.0
}
