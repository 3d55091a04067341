use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationRequest {
    pub image_url: String,
    #[serde(default)]
    pub declared_expiry_date: Option<String>,
}

/// Structured verdict for one label photo. This is also the terminal
/// "unverified" value: verification failures collapse into all-false booleans
/// with zero confidence rather than an error, so a bad image never aborts a
/// bulk batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub is_expiry_date_shown: bool,
    pub is_expiry_valid: bool,
    pub product_details: ProductDetails,
    pub confidence: f64,
}

impl VerificationResult {
    pub fn unverified() -> Self {
        Self {
            is_expiry_date_shown: false,
            is_expiry_valid: false,
            product_details: ProductDetails::default(),
            confidence: 0.0,
        }
    }

    pub fn qualifies(&self) -> bool {
        self.is_expiry_date_shown && self.is_expiry_valid
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

/// One per-image verdict inside a multi-image (best-of-N) run, tagged with
/// the photo it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAnalysis {
    pub image_url: String,
    #[serde(flatten)]
    pub result: VerificationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSetReport {
    pub is_valid: bool,
    pub analyses: Vec<ImageAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_match: Option<ImageAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkProduct {
    pub images: Vec<String>,
    pub expiry_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkVerificationRequest {
    pub products: Vec<BulkProduct>,
}

/// Results are positional: `results[i]` belongs to `products[i]` of the
/// request, so callers can zip them back onto their product list by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkVerificationResponse {
    pub results: Vec<VerificationResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSetRequest {
    pub images: Vec<String>,
    pub declared_expiry_date: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    #[default]
    New,
    LikeNew,
    Good,
    Fair,
}

impl Condition {
    pub fn label(&self) -> &'static str {
        match self {
            Condition::New => "NEW",
            Condition::LikeNew => "LIKE_NEW",
            Condition::Good => "GOOD",
            Condition::Fair => "FAIR",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceAnalysisRequest {
    pub original_price: f64,
    #[serde(default)]
    pub condition: Condition,
    pub description: String,
    pub title: String,
    pub category: String,
    pub manufacturer_date: String,
    pub expiry_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceFactors {
    pub condition: String,
    pub expiry: String,
    pub market: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceAnalysis {
    pub percentage: f64,
    pub reasoning: String,
    pub factors: PriceFactors,
}

/// Final pricing answer. The dollar figures are derived arithmetically from
/// the validated percentage, never taken from the model verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub seller_price: f64,
    pub market_price: f64,
    pub analysis: PriceAnalysis,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
