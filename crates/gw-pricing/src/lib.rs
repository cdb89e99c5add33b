//! Token tracker & cost model (C5). Stateless: every function is a pure
//! lookup/arithmetic operation over a fixed price table.

use gw_types::{ModelAlias, Usage};

#[derive(Debug, Clone, Copy)]
pub struct Rate {
    /// USD per million input tokens.
    pub input_per_mtok: f64,
    /// USD per million output tokens.
    pub output_per_mtok: f64,
}

const HAIKU_RATE: Rate = Rate {
    input_per_mtok: 0.80,
    output_per_mtok: 4.00,
};
const SONNET_RATE: Rate = Rate {
    input_per_mtok: 3.00,
    output_per_mtok: 15.00,
};
const OPUS_RATE: Rate = Rate {
    input_per_mtok: 15.00,
    output_per_mtok: 75.00,
};

/// Every request's estimated output when the caller didn't specify `max_tokens`.
pub const DEFAULT_MAX_TOKENS_ESTIMATE: u32 = 1024;

pub fn rate_for_alias(alias: ModelAlias) -> Rate {
    match alias {
        ModelAlias::Haiku => HAIKU_RATE,
        ModelAlias::Sonnet => SONNET_RATE,
        ModelAlias::Opus => OPUS_RATE,
    }
}

/// Looks up a rate by a free-form provider model name. Unknown names fall
/// back to the Sonnet rate and log a warning, per spec.
pub fn rate_for_model_name(model: &str) -> Rate {
    let lower = model.to_ascii_lowercase();
    if lower.contains("haiku") {
        HAIKU_RATE
    } else if lower.contains("opus") {
        OPUS_RATE
    } else if lower.contains("sonnet") {
        SONNET_RATE
    } else {
        tracing::warn!(model, "unknown model, defaulting to sonnet pricing");
        SONNET_RATE
    }
}

/// `cost = (input_tokens * in_rate + output_tokens * out_rate) / 1_000_000`.
/// Non-negative and monotonic in each argument by construction.
pub fn price(rate: Rate, input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 * rate.input_per_mtok + output_tokens as f64 * rate.output_per_mtok)
        / 1_000_000.0
}

pub fn price_usage(rate: Rate, usage: Usage) -> f64 {
    price(rate, usage.input_tokens, usage.output_tokens)
}

/// Pessimistic pre-flight estimate used to size a budget reservation:
/// input tokens from a prompt-length proxy (roughly 4 chars/token), output
/// from the caller's `max_tokens` or the endpoint default.
pub fn estimate_cost(rate: Rate, prompt_chars: usize, max_tokens: Option<u32>) -> f64 {
    let input_tokens = (prompt_chars as u64).div_ceil(4).max(1);
    let output_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS_ESTIMATE) as u64;
    price(rate, input_tokens, output_tokens)
}
