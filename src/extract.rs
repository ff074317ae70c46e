use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::config::Config;
use crate::models::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, Part,
};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENT: &str = "image-extract-api/1.0";
const RESPONSE_MIME_TYPE: &str = "application/json";
const API_KEY_HEADER: &str = "x-goog-api-key";

const TABLE_PROMPT: &str = "Extract the table from this image. Respond with a JSON array of arrays, \
where each inner array represents a row. Make the first row the header. Ensure all rows have the \
same number of columns. Do not include markdown formatting in your response.";

const LINES_PROMPT: &str = "Extract all text from this image, line by line. Respond with a JSON \
array of strings, where each string is a line of text. Do not include markdown formatting in \
your response.";

// ── Mode ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Table,
    Lines,
}

impl Mode {
    /// Only the exact literal `"true"` selects table extraction. An absent
    /// field selects lines too, so table callers must send `true` explicitly
    /// rather than relying on a `"true"` form default.
    pub fn from_form_value(value: Option<&str>) -> Self {
        match value {
            Some("true") => Mode::Table,
            _ => Mode::Lines,
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            Mode::Table => TABLE_PROMPT,
            Mode::Lines => LINES_PROMPT,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("TimeoutError: {0}")]
    Timeout(String),
    #[error("RequestError: {0}")]
    Request(String),
    #[error("Upstream returned status {0}")]
    Upstream(reqwest::StatusCode),
    #[error("Could not decode upstream response: {0}")]
    Decode(String),
    #[error("Upstream response had no text content")]
    EmptyResponse,
}

// ── Public API ───────────────────────────────────────────────────────────────

pub fn build_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::ClientBuilder::new()
        .timeout(config.upstream_timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Sends one image to the upstream model and returns its raw text output.
///
/// Every failure is logged and collapsed into `None`; the text is never
/// parsed even though the model was asked for JSON.
pub async fn extract_data(
    client: &reqwest::Client,
    config: &Config,
    image: &[u8],
    mime_type: &str,
    mode: Mode,
) -> Option<String> {
    match request_extraction(client, config, image, mime_type, mode).await {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(error = %e, ?mode, "error calling inference API");
            None
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

pub fn build_request<'a>(image: &[u8], mime_type: &'a str, mode: Mode) -> GenerateContentRequest<'a> {
    GenerateContentRequest {
        contents: vec![Content {
            parts: vec![
                Part::Text {
                    text: mode.prompt(),
                },
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type,
                        data: STANDARD.encode(image),
                    },
                },
            ],
        }],
        generation_config: GenerationConfig {
            response_mime_type: RESPONSE_MIME_TYPE,
        },
    }
}

// ── HTTP call ────────────────────────────────────────────────────────────────

async fn request_extraction(
    client: &reqwest::Client,
    config: &Config,
    image: &[u8],
    mime_type: &str,
    mode: Mode,
) -> Result<String, ExtractionError> {
    let payload = build_request(image, mime_type, mode);

    let response = client
        .post(config.api_url.clone())
        .header(API_KEY_HEADER, &config.api_key)
        .json(&payload)
        .send()
        .await
        .map_err(classify)?;

    let status = response.status();
    if !status.is_success() {
        return Err(ExtractionError::Upstream(status));
    }

    let body: GenerateContentResponse = response.json().await.map_err(|e| {
        if e.is_timeout() {
            ExtractionError::Timeout(e.to_string())
        } else {
            ExtractionError::Decode(e.to_string())
        }
    })?;

    body.into_first_text()
        .filter(|text| !text.is_empty())
        .ok_or(ExtractionError::EmptyResponse)
}

fn classify(e: reqwest::Error) -> ExtractionError {
    if e.is_timeout() {
        ExtractionError::Timeout(e.to_string())
    } else {
        ExtractionError::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn only_literal_true_selects_table_mode() {
        assert_eq!(Mode::from_form_value(Some("true")), Mode::Table);
        for other in [None, Some(""), Some("false"), Some("True"), Some("1"), Some(" true")] {
            assert_eq!(Mode::from_form_value(other), Mode::Lines, "{:?}", other);
        }
    }

    #[test]
    fn request_envelope_has_fixed_shape() {
        let payload = serde_json::to_value(build_request(b"abc", "image/png", Mode::Table)).unwrap();

        let parts = &payload["contents"][0]["parts"];
        assert_eq!(payload["contents"].as_array().unwrap().len(), 1);
        assert_eq!(parts.as_array().unwrap().len(), 2);
        assert_eq!(parts[0]["text"], TABLE_PROMPT);
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[1]["inline_data"]["data"], "YWJj");
        assert_eq!(
            payload["generation_config"]["response_mime_type"],
            "application/json"
        );
    }

    #[test]
    fn encoded_image_decodes_to_original_bytes() {
        let image: Vec<u8> = (0..=255).collect();
        let payload = serde_json::to_value(build_request(&image, "image/jpeg", Mode::Lines)).unwrap();
        let Value::String(data) = &payload["contents"][0]["parts"][1]["inline_data"]["data"] else {
            panic!("data is not a string");
        };
        assert_eq!(STANDARD.decode(data).unwrap(), image);
        assert_eq!(payload["contents"][0]["parts"][0]["text"], LINES_PROMPT);
    }

    #[test]
    fn response_text_is_read_from_first_candidate_part() {
        let body: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"[[\"a\"]]"},{"text":"x"}]}},{"content":{"parts":[{"text":"y"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(body.into_first_text().as_deref(), Some("[[\"a\"]]"));
    }

    #[test]
    fn missing_path_yields_no_text() {
        for raw in [
            r#"{}"#,
            r#"{"candidates":[]}"#,
            r#"{"candidates":[{}]}"#,
            r#"{"candidates":[{"content":{}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{}]}}]}"#,
        ] {
            let body: GenerateContentResponse = serde_json::from_str(raw).unwrap();
            assert!(body.into_first_text().is_none(), "{}", raw);
        }
    }
}
