use crate::llm::parse::extract_json;
use crate::llm::{ChatMessage, CompletionOptions, ModelGateway, RawModelResponse, ResponseFormat};
use crate::models::{
    BulkProduct, ImageAnalysis, ImageSetReport, ProductDetails, VerificationResult,
};
use crate::verify::image::ImagePreprocessor;
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

const MAX_OUTPUT_TOKENS: u32 = 500;

/// Days of slack when comparing the extracted expiry date against the
/// seller's declared one, to absorb OCR and timezone rounding noise.
const MATCH_TOLERANCE_DAYS: i64 = 1;

/// Verifies seller-declared expiry dates against label photos through the
/// vision gateway. Every failure mode (unfetchable image, gateway outage,
/// unparseable model output) collapses into the terminal unverified result;
/// the caller's gating decision treats "could not verify" the same as
/// "verification found a mismatch".
#[derive(Clone)]
pub struct VerificationEngine {
    gateway: Arc<dyn ModelGateway>,
    preprocessor: ImagePreprocessor,
}

impl VerificationEngine {
    pub fn new(gateway: Arc<dyn ModelGateway>, preprocessor: ImagePreprocessor) -> Self {
        Self {
            gateway,
            preprocessor,
        }
    }

    /// Single image, single product.
    pub async fn verify_expiry_date(
        &self,
        image_url: &str,
        declared_date: Option<&str>,
    ) -> VerificationResult {
        let payload = match self.preprocessor.prepare(image_url).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    target = "offermart.verify",
                    image_url,
                    error = %err,
                    "image_unusable"
                );
                return VerificationResult::unverified();
            }
        };

        let messages = vec![ChatMessage::user_with_image(
            verification_prompt(declared_date),
            payload.as_url(),
        )];
        let options = CompletionOptions {
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            response_format: Some(ResponseFormat::Json),
            ..CompletionOptions::default()
        };

        match self.gateway.complete(&messages, &options).await {
            Ok(response) => map_response(&response, declared_date),
            Err(err) => {
                warn!(
                    target = "offermart.verify",
                    image_url,
                    error = %err,
                    "gateway_call_failed"
                );
                VerificationResult::unverified()
            }
        }
    }

    /// One verdict per product, same index order as the input. Items run
    /// concurrently and fail independently; each product contributes only its
    /// first image.
    pub async fn verify_bulk_expiry_dates(
        &self,
        products: &[BulkProduct],
    ) -> Vec<VerificationResult> {
        let mut handles = Vec::with_capacity(products.len());
        for product in products {
            let engine = self.clone();
            let image = product.images.first().cloned();
            let declared = product.expiry_date.clone();
            handles.push(tokio::spawn(async move {
                match image {
                    Some(url) => engine.verify_expiry_date(&url, Some(&declared)).await,
                    None => VerificationResult::unverified(),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|_| VerificationResult::unverified()),
            );
        }
        results
    }

    /// Best-of-N over every photo of one product. `best_match` is the
    /// highest-confidence analysis among those where the date is both shown
    /// and valid; ties go to the earliest image in the input.
    pub async fn verify_product_images(
        &self,
        images: &[String],
        declared_date: &str,
    ) -> ImageSetReport {
        let mut handles = Vec::with_capacity(images.len());
        for image_url in images {
            let engine = self.clone();
            let url = image_url.clone();
            let declared = declared_date.to_string();
            handles.push(tokio::spawn(async move {
                let result = engine.verify_expiry_date(&url, Some(&declared)).await;
                ImageAnalysis {
                    image_url: url,
                    result,
                }
            }));
        }

        let mut analyses = Vec::with_capacity(handles.len());
        for (handle, image_url) in handles.into_iter().zip(images) {
            analyses.push(handle.await.unwrap_or_else(|_| ImageAnalysis {
                image_url: image_url.clone(),
                result: VerificationResult::unverified(),
            }));
        }

        let mut best_match: Option<&ImageAnalysis> = None;
        for analysis in &analyses {
            if !analysis.result.qualifies() {
                continue;
            }
            let beats = best_match
                .map(|best| analysis.result.confidence > best.result.confidence)
                .unwrap_or(true);
            if beats {
                best_match = Some(analysis);
            }
        }

        ImageSetReport {
            is_valid: best_match.is_some(),
            best_match: best_match.cloned(),
            analyses,
        }
    }
}

fn verification_prompt(declared_date: Option<&str>) -> String {
    let comparison = match declared_date {
        Some(date) => format!(
            "Compare it with the declared expiry date {date}. Set \"is_expiry_valid\" to true \
             only if the dates match exactly or differ by at most 1 day."
        ),
        None => "No declared expiry date was provided, so set \"is_expiry_valid\" to false."
            .to_string(),
    };

    format!(
        "Analyze this photographed product label. Determine whether an expiry date is visible \
         and report the exact date you can read. {comparison} Also report the batch number, \
         manufacturer date, storage instructions, where on the label the expiry date appears, \
         and any other relevant detail, when visible. Report a confidence score between 0 and 1 \
         for your reading. Respond with JSON only, no surrounding prose, in exactly this shape:\n\
         {{\"is_expiry_date_shown\": true, \"is_expiry_valid\": true, \"expiry_date\": \"2025-12-31\", \
         \"confidence\": 0.92, \"product_details\": {{\"expiry_location\": \"bottom right of label\", \
         \"batch_number\": \"B1234\", \"manufacturer_date\": \"2024-06-01\", \
         \"storage_info\": \"keep refrigerated\", \"additional_info\": \"\"}}}}"
    )
}

fn map_response(response: &RawModelResponse, declared_date: Option<&str>) -> VerificationResult {
    for choice in &response.choices {
        if let Some(result) = parse_candidate(choice, declared_date) {
            return result;
        }
    }
    VerificationResult::unverified()
}

/// Field-by-field defensive mapping of one candidate choice. Wrong shape and
/// wrong value are treated identically: the candidate is skipped and the next
/// one (or the terminal fallback) takes over.
fn parse_candidate(text: &str, declared_date: Option<&str>) -> Option<VerificationResult> {
    let cleaned = extract_json(text)?;
    let candidate: VerificationCandidate = serde_json::from_str(&cleaned).ok()?;

    let extracted = candidate.expiry_date.as_deref().and_then(parse_dateish);
    let declared = declared_date.and_then(parse_dateish);
    let is_expiry_valid = match (extracted, declared) {
        // Both dates are machine-readable: enforce the tolerance ourselves
        // instead of trusting the model's judgement of "close enough".
        (Some(seen), Some(stated)) => {
            (seen - stated).num_days().abs() <= MATCH_TOLERANCE_DAYS
        }
        _ => candidate.is_expiry_valid.unwrap_or(false),
    };

    let confidence = candidate
        .confidence
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    Some(VerificationResult {
        is_expiry_date_shown: candidate.is_expiry_date_shown.unwrap_or(false),
        is_expiry_valid,
        product_details: ProductDetails {
            expiry_location: clean(candidate.product_details.expiry_location),
            batch_number: clean(candidate.product_details.batch_number),
            manufacturer_date: clean(candidate.product_details.manufacturer_date),
            storage_info: clean(candidate.product_details.storage_info),
            additional_info: clean(candidate.product_details.additional_info),
        },
        confidence,
    })
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_dateish(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    chrono::DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.date_naive())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerificationCandidate {
    #[serde(alias = "isExpiryDateShown")]
    is_expiry_date_shown: Option<bool>,
    #[serde(alias = "isExpiryValid")]
    is_expiry_valid: Option<bool>,
    #[serde(alias = "expiryDate")]
    expiry_date: Option<String>,
    confidence: Option<f64>,
    #[serde(alias = "productDetails")]
    product_details: CandidateDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidateDetails {
    #[serde(alias = "expiryLocation")]
    expiry_location: Option<String>,
    #[serde(alias = "batchNumber")]
    batch_number: Option<String>,
    #[serde(alias = "manufacturerDate")]
    manufacturer_date: Option<String>,
    #[serde(alias = "storageInfo")]
    storage_info: Option<String>,
    #[serde(alias = "additionalInfo")]
    additional_info: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentPart, GatewayError, MessageContent};
    use crate::verify::image::PreprocessMode;
    use std::collections::HashMap;

    enum Scripted {
        Choices(Vec<String>),
        Outage,
    }

    /// Fake gateway keyed by the image URL inside the message, so concurrent
    /// calls resolve deterministically regardless of scheduling order.
    struct ScriptedGateway {
        responses: HashMap<String, Scripted>,
    }

    impl ScriptedGateway {
        fn new(entries: Vec<(&str, Scripted)>) -> Self {
            Self {
                responses: entries
                    .into_iter()
                    .map(|(url, scripted)| (url.to_string(), scripted))
                    .collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<RawModelResponse, GatewayError> {
            let url = messages
                .iter()
                .find_map(|message| match &message.content {
                    MessageContent::Parts(parts) => parts.iter().find_map(|part| match part {
                        ContentPart::ImageUrl { image_url } => Some(image_url.url.clone()),
                        _ => None,
                    }),
                    _ => None,
                })
                .unwrap_or_default();
            match self.responses.get(&url) {
                Some(Scripted::Choices(choices)) => Ok(RawModelResponse {
                    choices: choices.clone(),
                }),
                Some(Scripted::Outage) => {
                    Err(GatewayError::Transport("scripted outage".into()))
                }
                None => Err(GatewayError::Provider("no script for url".into())),
            }
        }
    }

    fn engine(gateway: ScriptedGateway) -> VerificationEngine {
        VerificationEngine::new(
            Arc::new(gateway),
            ImagePreprocessor::new(reqwest::Client::new(), PreprocessMode::Passthrough),
        )
    }

    fn verdict_json(shown: bool, valid: bool, date: &str, confidence: f64) -> String {
        format!(
            "{{\"is_expiry_date_shown\": {shown}, \"is_expiry_valid\": {valid}, \
             \"expiry_date\": \"{date}\", \"confidence\": {confidence}, \
             \"product_details\": {{\"batch_number\": \"B77\"}}}}"
        )
    }

    #[tokio::test]
    async fn unparseable_output_yields_terminal_unverified() {
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec!["the label is blurry, sorry".into()]),
        )]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert_eq!(result, VerificationResult::unverified());
    }

    #[tokio::test]
    async fn gateway_outage_yields_terminal_unverified() {
        let gateway = ScriptedGateway::new(vec![("https://img/a.jpg", Scripted::Outage)]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert_eq!(result, VerificationResult::unverified());
    }

    #[tokio::test]
    async fn maps_candidate_fields_and_drops_blank_strings() {
        let body = "```json\n{\"is_expiry_date_shown\": true, \"is_expiry_valid\": true, \
                    \"expiry_date\": \"2025-12-31\", \"confidence\": 0.87, \
                    \"product_details\": {\"batch_number\": \" B123 \", \"storage_info\": \"  \", \
                    \"manufacturer_date\": \"2024-06-01\"}}\n```";
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec![body.into()]),
        )]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert!(result.is_expiry_date_shown);
        assert!(result.is_expiry_valid);
        assert_eq!(result.confidence, 0.87);
        assert_eq!(result.product_details.batch_number.as_deref(), Some("B123"));
        assert_eq!(
            result.product_details.manufacturer_date.as_deref(),
            Some("2024-06-01")
        );
        assert_eq!(result.product_details.storage_info, None);
    }

    #[tokio::test]
    async fn second_choice_is_tried_when_the_first_fails_to_parse() {
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec![
                "not json at all".into(),
                verdict_json(true, true, "2025-12-31", 0.7),
            ]),
        )]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert!(result.is_expiry_date_shown);
        assert_eq!(result.confidence, 0.7);
    }

    #[tokio::test]
    async fn tolerance_overrides_model_verdict_within_one_day() {
        // Model says mismatch, but the extracted date is one day off: valid.
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec![verdict_json(true, false, "2025-12-30", 0.9)]),
        )]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert!(result.is_expiry_valid);
    }

    #[tokio::test]
    async fn tolerance_overrides_model_verdict_beyond_one_day() {
        // Model claims a match, but the dates are six days apart: invalid.
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec![verdict_json(true, true, "2025-12-25", 0.9)]),
        )]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert!(!result.is_expiry_valid);
    }

    #[tokio::test]
    async fn model_verdict_stands_when_extracted_date_is_unreadable() {
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec![
                "{\"is_expiry_date_shown\": true, \"is_expiry_valid\": true, \
                 \"expiry_date\": \"illegible\", \"confidence\": 0.4}"
                    .into(),
            ]),
        )]);
        let result = engine(gateway)
            .verify_expiry_date("https://img/a.jpg", Some("2025-12-31"))
            .await;
        assert!(result.is_expiry_valid);
    }

    #[tokio::test]
    async fn bulk_preserves_input_order_and_isolates_failures() {
        let gateway = ScriptedGateway::new(vec![
            (
                "https://img/1.jpg",
                Scripted::Choices(vec![verdict_json(true, true, "2025-12-31", 0.91)]),
            ),
            ("https://img/2.jpg", Scripted::Outage),
            (
                "https://img/3.jpg",
                Scripted::Choices(vec![verdict_json(true, true, "2025-12-31", 0.33)]),
            ),
        ]);
        let products = vec![
            BulkProduct {
                images: vec!["https://img/1.jpg".into()],
                expiry_date: "2025-12-31".into(),
            },
            BulkProduct {
                images: vec!["https://img/2.jpg".into()],
                expiry_date: "2025-12-31".into(),
            },
            BulkProduct {
                images: vec!["https://img/3.jpg".into()],
                expiry_date: "2025-12-31".into(),
            },
        ];
        let results = engine(gateway).verify_bulk_expiry_dates(&products).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].confidence, 0.91);
        assert_eq!(results[1], VerificationResult::unverified());
        assert_eq!(results[2].confidence, 0.33);
    }

    #[tokio::test]
    async fn bulk_product_without_images_is_unverified() {
        let gateway = ScriptedGateway::new(vec![]);
        let products = vec![BulkProduct {
            images: vec![],
            expiry_date: "2025-12-31".into(),
        }];
        let results = engine(gateway).verify_bulk_expiry_dates(&products).await;
        assert_eq!(results, vec![VerificationResult::unverified()]);
    }

    #[tokio::test]
    async fn best_match_picks_the_highest_confidence_qualifier() {
        let gateway = ScriptedGateway::new(vec![
            (
                "https://img/front.jpg",
                Scripted::Choices(vec![verdict_json(true, false, "2025-01-01", 0.95)]),
            ),
            (
                "https://img/back.jpg",
                Scripted::Choices(vec![verdict_json(true, true, "2025-12-31", 0.62)]),
            ),
            (
                "https://img/side.jpg",
                Scripted::Choices(vec!["garbage".into()]),
            ),
        ]);
        let images = vec![
            "https://img/front.jpg".to_string(),
            "https://img/back.jpg".to_string(),
            "https://img/side.jpg".to_string(),
        ];
        let report = engine(gateway)
            .verify_product_images(&images, "2025-12-31")
            .await;
        assert!(report.is_valid);
        assert_eq!(report.analyses.len(), 3);
        assert_eq!(report.analyses[0].image_url, "https://img/front.jpg");
        let best = report.best_match.expect("one image qualifies");
        assert_eq!(best.image_url, "https://img/back.jpg");
    }

    #[tokio::test]
    async fn best_match_tie_goes_to_the_earliest_image() {
        let gateway = ScriptedGateway::new(vec![
            (
                "https://img/a.jpg",
                Scripted::Choices(vec![verdict_json(true, true, "2025-12-31", 0.8)]),
            ),
            (
                "https://img/b.jpg",
                Scripted::Choices(vec![verdict_json(true, true, "2025-12-31", 0.8)]),
            ),
        ]);
        let images = vec!["https://img/a.jpg".to_string(), "https://img/b.jpg".to_string()];
        let report = engine(gateway)
            .verify_product_images(&images, "2025-12-31")
            .await;
        assert_eq!(
            report.best_match.unwrap().image_url,
            "https://img/a.jpg"
        );
    }

    #[tokio::test]
    async fn no_qualifying_image_means_invalid_and_no_best_match() {
        let gateway = ScriptedGateway::new(vec![(
            "https://img/a.jpg",
            Scripted::Choices(vec![verdict_json(false, false, "2025-12-31", 0.9)]),
        )]);
        let images = vec!["https://img/a.jpg".to_string()];
        let report = engine(gateway)
            .verify_product_images(&images, "2025-12-31")
            .await;
        assert!(!report.is_valid);
        assert!(report.best_match.is_none());
        assert_eq!(report.analyses.len(), 1);
    }
}
