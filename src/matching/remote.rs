//! Model-backed comparator reached over HTTP.
//!
//! The endpoint receives a prompt and answers with free text that should
//! contain a JSON object (single) or array (batch). Everything coming back
//! passes through [`parse_decision`] / [`parse_batch`], which reject anything
//! that does not have the expected shape.
//!
//! When both products carry an image URL, single comparisons fetch the two
//! images and send them inline with the prompt. If either image cannot be
//! used, or the image comparison fails, the text-only prompt is used instead.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::matching::Comparator;
use crate::types::{Candidate, MatchDecision, MatchFactors, Product};

const MATCHING_RULES: &str = "\
IMPORTANT RULES:
- Different colors/sizes/storage of same product = NOT a match (confidence < 0.70)
- Same exact product from different sellers = MATCH (confidence >= 0.85)
- Similar products with minor spec differences = POSSIBLE MATCH (confidence 0.70-0.84)
- Consider bundle vs single item carefully
- Price differences up to 30% are normal across marketplaces";

const DECISION_SHAPE: &str = r#"{
  "isMatch": true or false,
  "confidence": 0.95,
  "reasoning": "Brief explanation",
  "factors": { "nameMatch": 0.90, "priceMatch": 0.85, "specsMatch": 0.95 }
}"#;

const IMAGE_RULES: &str = "\
Analyze both the visual appearance and the text to determine if they show the same product.

IMPORTANT:
- Different colors/sizes of same product model = NOT a match
- Same product from different angles = MATCH
- Focus on brand logos, model numbers, unique features";

const IMAGE_DECISION_SHAPE: &str = r#"{
  "isMatch": true or false,
  "confidence": 0.95,
  "reasoning": "Combined visual and textual analysis",
  "factors": { "nameMatch": 0.90, "priceMatch": 0.85, "specsMatch": 0.95, "imageMatch": 0.92 }
}"#;

/// Larger images are not sent; the comparison falls back to text.
const MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineImage {
    mime_type: String,
    /// Base64, standard alphabet.
    data: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [InlineImage],
}

fn no_images(images: &&[InlineImage]) -> bool {
    images.is_empty()
}

pub struct RemoteComparator {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl RemoteComparator {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, api_key })
    }

    async fn complete(&self, prompt: &str, images: &[InlineImage]) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AppError::MatchingUnavailable("MATCHER_API_KEY not configured".to_string()));
        };

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&CompletionRequest { prompt, images })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::MatchingUnavailable(format!(
                "comparator returned HTTP {}",
                resp.status()
            )));
        }

        let body = resp.text().await?;
        // Either a JSON envelope with a `text` field or the bare model output.
        let text = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or(body);
        Ok(text)
    }

    async fn fetch_image(&self, url: &str) -> Result<InlineImage> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::MatchingUnavailable(format!("image {url} returned HTTP {}", resp.status())));
        }
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "image/jpeg".to_string());
        if !mime_type.starts_with("image/") {
            return Err(AppError::MatchingUnavailable(format!("{url} is not an image ({mime_type})")));
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() || bytes.len() > MAX_IMAGE_BYTES {
            return Err(AppError::MatchingUnavailable(format!("image {url} has unusable size {}", bytes.len())));
        }
        Ok(InlineImage { mime_type, data: BASE64.encode(&bytes) })
    }

    async fn compare_with_images(
        &self,
        reference: &Product,
        candidate: &Candidate,
        (reference_image, candidate_image): (&str, &str),
    ) -> Result<MatchDecision> {
        let (reference_image, candidate_image) =
            futures_util::future::try_join(self.fetch_image(reference_image), self.fetch_image(candidate_image))
                .await?;
        let prompt = format!(
            "Compare these two product images and text descriptions.\n\n\
             PRODUCT 1 (Reference):\n{}\n\nPRODUCT 2 (Candidate):\n{}\n\n{}\n\nReturn ONLY valid JSON:\n{}",
            describe(reference),
            describe_candidate(candidate),
            IMAGE_RULES,
            IMAGE_DECISION_SHAPE,
        );
        let text = self.complete(&prompt, &[reference_image, candidate_image]).await?;
        parse_decision(&text)
    }

    async fn compare_text(&self, reference: &Product, candidate: &Candidate) -> Result<MatchDecision> {
        let prompt = format!(
            "You are a product matching expert. Compare these two products and determine if they are the same item.\n\n\
             REFERENCE PRODUCT:\n{}\n\nCANDIDATE PRODUCT:\n{}\n\n{}\n\nReturn ONLY valid JSON in this exact format:\n{}",
            describe(reference),
            describe_candidate(candidate),
            MATCHING_RULES,
            DECISION_SHAPE,
        );
        let text = self.complete(&prompt, &[]).await?;
        parse_decision(&text)
    }
}

/// Both image URLs, when both products have one.
fn image_pair<'a>(reference: &'a Product, candidate: &'a Candidate) -> Option<(&'a str, &'a str)> {
    let present = |u: &'a Option<String>| u.as_deref().map(str::trim).filter(|u| !u.is_empty());
    Some((present(&reference.image_url)?, present(&candidate.product.image_url)?))
}

#[async_trait]
impl Comparator for RemoteComparator {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn compare(&self, reference: &Product, candidate: &Candidate) -> Result<MatchDecision> {
        if let Some(images) = image_pair(reference, candidate) {
            match self.compare_with_images(reference, candidate, images).await {
                Ok(decision) => return Ok(decision),
                Err(e) => warn!(candidate = %candidate.product.name, "Image comparison failed, using text only: {e}"),
            }
        } else {
            debug!(candidate = %candidate.product.name, "No image pair, comparing text only");
        }
        self.compare_text(reference, candidate).await
    }

    async fn compare_batch(
        &self,
        reference: &Product,
        candidates: &[Candidate],
    ) -> Result<Vec<MatchDecision>> {
        let listed: Vec<String> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("CANDIDATE {}:\n{}", i + 1, describe_candidate(c)))
            .collect();
        let prompt = format!(
            "You are a product matching expert. Compare the reference product with each candidate and determine if they are the same item.\n\n\
             REFERENCE PRODUCT:\n{}\n\n{}\n\n{}\n\nReturn ONLY a valid JSON array with one object per candidate, each in this format:\n{}\n\n\
             Return exactly {} results in the same order as the candidates.",
            describe(reference),
            listed.join("\n\n"),
            MATCHING_RULES,
            DECISION_SHAPE,
            candidates.len(),
        );
        let text = self.complete(&prompt, &[]).await?;
        parse_batch(&text, candidates.len())
    }
}

fn describe(p: &Product) -> String {
    format!(
        "Name: {}\nPrice: {}\nURL: {}",
        p.name,
        p.price.map(|v| format!("${v:.2}")).unwrap_or_else(|| "unknown".to_string()),
        p.url.as_deref().unwrap_or("unknown"),
    )
}

fn describe_candidate(c: &Candidate) -> String {
    format!("{}\nMarketplace: {}", describe(&c.product), c.marketplace)
}

// ---------------------------------------------------------------------------
// Validating adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFactors {
    name_match: f64,
    price_match: f64,
    specs_match: f64,
    #[serde(default)]
    image_match: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    is_match: bool,
    confidence: f64,
    reasoning: String,
    factors: RawFactors,
}

impl RawDecision {
    fn validate(self) -> Result<MatchDecision> {
        let f = &self.factors;
        let numbers = [Some(self.confidence), Some(f.name_match), Some(f.price_match), Some(f.specs_match), f.image_match];
        if numbers.iter().flatten().any(|v| !v.is_finite()) {
            return Err(AppError::MatchingUnavailable("non-finite score in comparator output".to_string()));
        }
        Ok(MatchDecision {
            is_match: self.is_match,
            confidence: self.confidence.clamp(0.0, 1.0),
            reasoning: self.reasoning,
            factors: MatchFactors {
                name_match: f.name_match.clamp(0.0, 1.0),
                price_match: f.price_match.clamp(0.0, 1.0),
                specs_match: f.specs_match.clamp(0.0, 1.0),
                image_match: f.image_match.map(|v| v.clamp(0.0, 1.0)),
            },
            degraded: false,
        })
    }
}

/// Extract the outermost `open`..`close` span from free text.
fn extract_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_decision(text: &str) -> Result<MatchDecision> {
    let json = extract_span(text, '{', '}')
        .ok_or_else(|| AppError::MatchingUnavailable("no JSON object in comparator output".to_string()))?;
    let raw: RawDecision = serde_json::from_str(json)
        .map_err(|e| AppError::MatchingUnavailable(format!("malformed comparator output: {e}")))?;
    raw.validate()
}

pub fn parse_batch(text: &str, expected: usize) -> Result<Vec<MatchDecision>> {
    let json = extract_span(text, '[', ']')
        .ok_or_else(|| AppError::MatchingUnavailable("no JSON array in comparator output".to_string()))?;
    let raw: Vec<RawDecision> = serde_json::from_str(json)
        .map_err(|e| AppError::MatchingUnavailable(format!("malformed comparator batch output: {e}")))?;
    if raw.len() != expected {
        return Err(AppError::MatchingUnavailable(format!(
            "comparator returned {} results for {expected} candidates",
            raw.len()
        )));
    }
    raw.into_iter().map(RawDecision::validate).collect()
}
