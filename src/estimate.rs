//! Carbon-emission estimate for generated tokens.
//!
//! This is a fixed linear model over assumed parameter counts, not a
//! physically validated measurement. It exists to make relative
//! comparisons between chats, nothing more.

/// kWh consumed per generated token per billion active parameters.
const ENERGY_KWH_PER_TOKEN_PER_BILLION_PARAMS: f64 = 7.594e-9;

/// Datacenter power usage effectiveness.
const PUE: f64 = 1.2;

/// Grid carbon intensity, kg CO2 per kWh.
const CARBON_INTENSITY_KG_PER_KWH: f64 = 0.379;

const DEFAULT_PARAMS_BILLION: f64 = 500.0;

/// Assumed active-parameter counts, in billions. Matched by substring,
/// first hit wins, so more specific names come first.
const MODEL_PARAMS_BILLION: &[(&str, f64)] = &[
    ("gpt-4o-mini", 8.0),
    ("gpt-4o", 200.0),
    ("gpt-4", 440.0),
    ("gpt-3.5", 175.0),
    ("haiku", 30.0),
    ("sonnet", 70.0),
    ("opus", 400.0),
    ("flash", 30.0),
    ("gemini-1.5-pro", 200.0),
    // Site-tag fallbacks, used when no model slug was detected.
    ("chatgpt", 200.0),
    ("claude", 70.0),
    ("gemini", 120.0),
];

#[must_use]
pub fn params_billion(model: &str) -> f64 {
    let model = model.to_ascii_lowercase();
    MODEL_PARAMS_BILLION
        .iter()
        .find(|(name, _)| model.contains(name))
        .map_or(DEFAULT_PARAMS_BILLION, |(_, params)| *params)
}

/// Estimated grams of CO2 emitted generating `output_tokens` tokens with
/// `model`. Deterministic and monotone in `output_tokens`.
#[must_use]
pub fn grams(model: &str, output_tokens: u64) -> f64 {
    let params = params_billion(model);
    let energy_kwh = ENERGY_KWH_PER_TOKEN_PER_BILLION_PARAMS
        * params
        * output_tokens as f64
        * PUE;
    energy_kwh * CARBON_INTENSITY_KG_PER_KWH * 1000.0
}
