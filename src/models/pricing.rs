use serde::{Deserialize, Serialize};

/// A single usage observation handed to the pricing schema that owns a
/// model (GLOSSARY "Pricing"). Not every field applies to every
/// schema; schemas read only the fields relevant to their formula.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub images: u32,
    pub video_seconds: f64,
    pub inference_steps: u32,
    pub audio_minutes: f64,
    pub characters: u64,
    pub resolution: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    pub up_to: Option<u64>,
    pub rate: f64,
}

/// One pricing schema per billing shape (GLOSSARY). The Cost Service
/// selects a schema by model metadata, not by provider, since two
/// providers can bill the same model shape differently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PricingSchema {
    PerToken {
        input_rate_per_1k: f64,
        output_rate_per_1k: f64,
    },
    PerImage {
        base_rate: f64,
        quality_multipliers: Vec<(String, f64)>,
        resolution_multipliers: Vec<(String, f64)>,
    },
    PerVideo {
        base_rate: f64,
        resolution_multipliers: Vec<(String, f64)>,
    },
    PerSecondVideo {
        rate_per_second: f64,
    },
    InferenceSteps {
        rate_per_step: f64,
        default_steps: u32,
    },
    TieredTokens {
        input_tiers: Vec<Tier>,
        output_tiers: Vec<Tier>,
    },
    PerMinuteAudio {
        rate_per_minute: f64,
    },
    PerThousandCharacters {
        rate_per_1k_chars: f64,
    },
}

impl PricingSchema {
    /// Applies the schema's formula to a usage record, in USD.
    pub fn cost(&self, usage: &Usage) -> f64 {
        match self {
            PricingSchema::PerToken {
                input_rate_per_1k,
                output_rate_per_1k,
            } => {
                (usage.input_tokens as f64 / 1000.0) * input_rate_per_1k
                    + (usage.output_tokens as f64 / 1000.0) * output_rate_per_1k
            }
            PricingSchema::PerImage {
                base_rate,
                quality_multipliers,
                resolution_multipliers,
            } => {
                let quality_mult = usage
                    .quality
                    .as_deref()
                    .and_then(|q| quality_multipliers.iter().find(|(k, _)| k == q))
                    .map(|(_, m)| *m)
                    .unwrap_or(1.0);
                let resolution_mult = usage
                    .resolution
                    .as_deref()
                    .and_then(|r| resolution_multipliers.iter().find(|(k, _)| k == r))
                    .map(|(_, m)| *m)
                    .unwrap_or(1.0);
                base_rate * quality_mult * resolution_mult * usage.images.max(1) as f64
            }
            PricingSchema::PerVideo {
                base_rate,
                resolution_multipliers,
            } => {
                let resolution_mult = usage
                    .resolution
                    .as_deref()
                    .and_then(|r| resolution_multipliers.iter().find(|(k, _)| k == r))
                    .map(|(_, m)| *m)
                    .unwrap_or(1.0);
                base_rate * resolution_mult
            }
            PricingSchema::PerSecondVideo { rate_per_second } => rate_per_second * usage.video_seconds,
            PricingSchema::InferenceSteps {
                rate_per_step,
                default_steps,
            } => {
                let steps = if usage.inference_steps == 0 {
                    *default_steps
                } else {
                    usage.inference_steps
                };
                rate_per_step * steps as f64
            }
            PricingSchema::TieredTokens {
                input_tiers,
                output_tiers,
            } => tiered_cost(input_tiers, usage.input_tokens) + tiered_cost(output_tiers, usage.output_tokens),
            PricingSchema::PerMinuteAudio { rate_per_minute } => rate_per_minute * usage.audio_minutes,
            PricingSchema::PerThousandCharacters { rate_per_1k_chars } => {
                (usage.characters as f64 / 1000.0) * rate_per_1k_chars
            }
        }
    }
}

fn tiered_cost(tiers: &[Tier], quantity: u64) -> f64 {
    let mut remaining = quantity;
    let mut consumed: u64 = 0;
    let mut total = 0.0;
    for tier in tiers {
        if remaining == 0 {
            break;
        }
        let ceiling = tier.up_to.unwrap_or(u64::MAX);
        let capacity = ceiling.saturating_sub(consumed);
        let used = remaining.min(capacity);
        total += used as f64 * tier.rate;
        remaining -= used;
        consumed += used;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_token_cost_scales_with_usage() {
        let schema = PricingSchema::PerToken {
            input_rate_per_1k: 0.01,
            output_rate_per_1k: 0.03,
        };
        let usage = Usage {
            input_tokens: 2000,
            output_tokens: 1000,
            ..Default::default()
        };
        assert!((schema.cost(&usage) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn tiered_tokens_spill_into_next_tier() {
        let tiers = vec![
            Tier { up_to: Some(1000), rate: 0.01 },
            Tier { up_to: None, rate: 0.005 },
        ];
        let cost = tiered_cost(&tiers, 1500);
        assert!((cost - (1000.0 * 0.01 + 500.0 * 0.005)).abs() < 1e-9);
    }
}
