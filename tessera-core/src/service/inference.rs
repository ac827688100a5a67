use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{
    classify_status, CallError, LayoutReply, LayoutService, OcrReply, OcrService,
    PageImageRequest,
};
use crate::provider::{LayoutRegion, Line};

/// JSON-over-HTTP client for a layout or OCR inference server.
///
/// The server receives a [`PageImageRequest`] and answers with
/// `{"regions": [...]}` (layout) or `{"lines": [...]}` (OCR).
#[derive(Debug, Clone)]
pub struct HttpInferenceService {
    client: reqwest::Client,
    url: String,
}

impl HttpInferenceService {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_owned(),
        }
    }

    async fn post<T: DeserializeOwned>(&self, request: &PageImageRequest) -> Result<T, CallError> {
        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| CallError::Rejected(format!("malformed reply: {e}")))
    }
}

#[async_trait]
impl LayoutService for HttpInferenceService {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn detect(&self, request: &PageImageRequest) -> Result<Vec<LayoutRegion>, CallError> {
        self.post::<LayoutReply>(request).await.map(|r| r.regions)
    }
}

#[async_trait]
impl OcrService for HttpInferenceService {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn recognize(&self, request: &PageImageRequest) -> Result<Vec<Line>, CallError> {
        self.post::<OcrReply>(request).await.map(|r| r.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LayoutLabel;

    #[test]
    fn decodes_replies() {
        let layout: LayoutReply = serde_json::from_str(
            r#"{"regions": [{"bbox": {"x0": 0, "y0": 0, "x1": 10, "y1": 10}, "label": "Section-header", "proba": 0.9}]}"#,
        )
        .unwrap();
        assert_eq!(layout.regions[0].label, LayoutLabel::SectionHeader);

        let ocr: OcrReply = serde_json::from_str(
            r#"{"lines": [{"text": "hello", "bbox": {"x0": 0, "y0": 0, "x1": 10, "y1": 4}}]}"#,
        )
        .unwrap();
        assert_eq!(ocr.lines[0].text, "hello");
    }
}
