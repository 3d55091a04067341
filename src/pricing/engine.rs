use crate::llm::parse::extract_json;
use crate::llm::{ChatMessage, CompletionOptions, GatewayError, ModelGateway};
use crate::models::{PriceAnalysis, PriceAnalysisRequest, PriceFactors, PriceQuote};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Policy bounds for the model's percentage recommendation. Values outside
/// the range are rejected outright, never clamped: an out-of-range number
/// means the model ignored the contract, so its other fields are equally
/// untrustworthy.
const PERCENT_MIN: f64 = 40.0;
const PERCENT_MAX: f64 = 60.0;

/// Buyers always see 70% of original price; only the seller payout moves
/// with the recommendation.
const MARKET_RATE: f64 = 0.7;

const CANDIDATE_CHOICES: u8 = 3;
const TEMPERATURE: f32 = 0.7;

const SYSTEM_PROMPT: &str = r#"You are a product pricing expert. Analyze the product and return a JSON object.

Response format:
{
  "percentage": number,
  "reasoning": string,
  "condition_factor": string,
  "expiry_factor": string,
  "market_factor": string
}

Rules:
1. Return ONLY the JSON object, no other text
2. percentage must be between 40 and 60
3. Better condition items get higher percentage
4. Items near expiry get lower percentage
5. Consider market demand and brand value"#;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// Every candidate choice failed validation. Surfaced explicitly so the
    /// caller can fall back to manual price entry; a fabricated percentage is
    /// worse than an honest failure.
    #[error("no pricing candidate passed validation")]
    Unavailable,
}

pub struct PricingEngine {
    gateway: Arc<dyn ModelGateway>,
}

impl PricingEngine {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Asks the pricing model for a percentage-of-original-price split and
    /// derives the concrete prices arithmetically. The model never supplies
    /// the final dollar amounts.
    pub async fn predict_price(
        &self,
        request: &PriceAnalysisRequest,
    ) -> Result<PriceQuote, PricingError> {
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt(request)),
        ];
        let options = CompletionOptions {
            temperature: Some(TEMPERATURE),
            n: Some(CANDIDATE_CHOICES),
            ..CompletionOptions::default()
        };

        let response = self.gateway.complete(&messages, &options).await?;

        for (index, choice) in response.choices.iter().enumerate() {
            match validate_candidate(choice) {
                Some(analysis) => {
                    let (seller_price, market_price) =
                        derive_pricing(request.original_price, analysis.percentage);
                    return Ok(PriceQuote {
                        seller_price,
                        market_price,
                        analysis,
                    });
                }
                None => {
                    warn!(
                        target = "offermart.pricing",
                        choice = index,
                        "pricing_candidate_rejected"
                    );
                }
            }
        }

        Err(PricingError::Unavailable)
    }
}

fn user_prompt(request: &PriceAnalysisRequest) -> String {
    format!(
        "Analyze and price this product:\n\
         Title: {title}\n\
         Category: {category}\n\
         Condition: {condition}\n\
         Description: {description}\n\
         Original Price: ${original_price}\n\
         Manufacturer Date: {manufacturer_date}\n\
         Expiry Date: {expiry_date}",
        title = request.title,
        category = request.category,
        condition = request.condition.label(),
        description = request.description,
        original_price = request.original_price,
        manufacturer_date = request.manufacturer_date,
        expiry_date = request.expiry_date,
    )
}

/// Accepts a candidate only when it parses as JSON and its percentage is a
/// finite number inside the policy range.
fn validate_candidate(choice: &str) -> Option<PriceAnalysis> {
    let cleaned = extract_json(choice)?;
    let candidate: PricingCandidate = serde_json::from_str(&cleaned).ok()?;
    let percentage = candidate.percentage?;
    if !percentage.is_finite() || percentage < PERCENT_MIN || percentage > PERCENT_MAX {
        return None;
    }
    Some(PriceAnalysis {
        percentage,
        reasoning: candidate.reasoning.unwrap_or_default(),
        factors: PriceFactors {
            condition: candidate.condition_factor.unwrap_or_default(),
            expiry: candidate.expiry_factor.unwrap_or_default(),
            market: candidate.market_factor.unwrap_or_default(),
        },
    })
}

/// seller = round2(original × pct / 100); market = round2(original × 0.7).
/// Plain arithmetic, half-up rounding, no model involvement.
pub fn derive_pricing(original_price: f64, percentage: f64) -> (f64, f64) {
    let seller_price = round2(original_price * percentage / 100.0);
    let market_price = round2(original_price * MARKET_RATE);
    (seller_price, market_price)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PricingCandidate {
    percentage: Option<f64>,
    reasoning: Option<String>,
    condition_factor: Option<String>,
    expiry_factor: Option<String>,
    market_factor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RawModelResponse;
    use crate::models::Condition;
    use tokio::sync::Mutex;

    enum Scripted {
        Choices(Vec<String>),
        Outage,
    }

    struct ScriptedGateway {
        script: Mutex<Vec<Scripted>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<RawModelResponse, GatewayError> {
            let mut guard = self.script.lock().await;
            match guard.remove(0) {
                Scripted::Choices(choices) => Ok(RawModelResponse { choices }),
                Scripted::Outage => Err(GatewayError::Transport("scripted outage".into())),
            }
        }
    }

    fn engine(script: Vec<Scripted>) -> PricingEngine {
        PricingEngine::new(Arc::new(ScriptedGateway::new(script)))
    }

    fn sample_request(original_price: f64) -> PriceAnalysisRequest {
        PriceAnalysisRequest {
            original_price,
            condition: Condition::Good,
            description: "Organic honey, unopened jar".into(),
            title: "Organic Honey 500g".into(),
            category: "Pantry".into(),
            manufacturer_date: "2024-06-01".into(),
            expiry_date: "2025-12-31".into(),
        }
    }

    fn candidate_json(percentage: &str) -> String {
        format!(
            "{{\"percentage\": {percentage}, \"reasoning\": \"solid demand\", \
             \"condition_factor\": \"unopened\", \"expiry_factor\": \"over a year left\", \
             \"market_factor\": \"popular brand\"}}"
        )
    }

    #[tokio::test]
    async fn derives_prices_from_the_validated_percentage() {
        let engine = engine(vec![Scripted::Choices(vec![candidate_json("55")])]);
        let quote = engine.predict_price(&sample_request(100.0)).await.unwrap();
        assert_eq!(quote.seller_price, 55.0);
        assert_eq!(quote.market_price, 70.0);
        assert_eq!(quote.analysis.percentage, 55.0);
        assert_eq!(quote.analysis.factors.condition, "unopened");
    }

    #[tokio::test]
    async fn skips_invalid_choices_and_accepts_the_first_valid_one() {
        let engine = engine(vec![Scripted::Choices(vec![
            candidate_json("72"),
            candidate_json("45"),
            "{\"percentage\": \"not a number\"}".into(),
        ])]);
        let quote = engine.predict_price(&sample_request(100.0)).await.unwrap();
        assert_eq!(quote.analysis.percentage, 45.0);
        assert_eq!(quote.seller_price, 45.0);
    }

    #[tokio::test]
    async fn out_of_range_percentages_are_rejected_not_clamped() {
        let engine = engine(vec![Scripted::Choices(vec![
            candidate_json("39.9"),
            candidate_json("60.1"),
            "no json here".into(),
        ])]);
        let err = engine
            .predict_price(&sample_request(100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PricingError::Unavailable));
    }

    #[tokio::test]
    async fn range_boundaries_are_inclusive() {
        let low = engine(vec![Scripted::Choices(vec![candidate_json("40")])]);
        assert_eq!(
            low.predict_price(&sample_request(100.0))
                .await
                .unwrap()
                .analysis
                .percentage,
            40.0
        );
        let high = engine(vec![Scripted::Choices(vec![candidate_json("60")])]);
        assert_eq!(
            high.predict_price(&sample_request(100.0))
                .await
                .unwrap()
                .analysis
                .percentage,
            60.0
        );
    }

    #[tokio::test]
    async fn fenced_candidates_are_unwrapped_before_parsing() {
        let fenced = format!("```json\n{}\n```", candidate_json("52"));
        let engine = engine(vec![Scripted::Choices(vec![fenced])]);
        let quote = engine.predict_price(&sample_request(80.0)).await.unwrap();
        assert_eq!(quote.analysis.percentage, 52.0);
        assert_eq!(quote.seller_price, 41.6);
    }

    #[tokio::test]
    async fn gateway_errors_propagate_unmodified() {
        let engine = engine(vec![Scripted::Outage]);
        let err = engine
            .predict_price(&sample_request(100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PricingError::Gateway(GatewayError::Transport(_))));
    }

    #[test]
    fn derive_pricing_matches_the_documented_examples() {
        assert_eq!(derive_pricing(100.0, 55.0), (55.0, 70.0));
        let (seller, market) = derive_pricing(49.99, 42.0);
        assert_eq!(seller, 21.0);
        assert_eq!(market, 34.99);
    }

    #[test]
    fn derive_pricing_is_bit_for_bit_deterministic() {
        let first = derive_pricing(73.37, 47.0);
        let second = derive_pricing(73.37, 47.0);
        assert_eq!(first.0.to_bits(), second.0.to_bits());
        assert_eq!(first.1.to_bits(), second.1.to_bits());
    }

    #[test]
    fn market_price_ignores_the_recommended_percentage() {
        let (_, market_low) = derive_pricing(100.0, 40.0);
        let (_, market_high) = derive_pricing(100.0, 60.0);
        assert_eq!(market_low, 70.0);
        assert_eq!(market_high, 70.0);
    }
}
