use dicomgate_types::GatewayError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::script::{TagAction, TagOp};

/// Region reported by the OCR text-detection service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OcrRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Whether the service classified the detected text as PHI
    pub is_phi: bool,
    #[serde(default)]
    pub text: Option<String>,
}

impl OcrRegion {
    fn right(&self) -> u32 {
        self.x + self.w
    }

    fn bottom(&self) -> u32 {
        self.y + self.h
    }

    fn overlaps(&self, other: &OcrRegion) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    fn merge_with(&self, other: &OcrRegion) -> OcrRegion {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        OcrRegion {
            x,
            y,
            w: self.right().max(other.right()) - x,
            h: self.bottom().max(other.bottom()) - y,
            is_phi: true,
            text: None,
        }
    }

    fn padded(&self, padding: u32) -> OcrRegion {
        OcrRegion {
            x: self.x.saturating_sub(padding),
            y: self.y.saturating_sub(padding),
            w: self.w + padding * 2,
            h: self.h + padding * 2,
            is_phi: self.is_phi,
            text: self.text.clone(),
        }
    }
}

/// Merge overlapping PHI boxes after padding each one. Non-PHI regions are
/// dropped; the result is the rectangle set to redact.
pub fn merge_regions(regions: &[OcrRegion], padding: u32) -> Vec<OcrRegion> {
    let mut boxes: Vec<OcrRegion> = regions
        .iter()
        .filter(|r| r.is_phi)
        .map(|r| r.padded(padding))
        .collect();

    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                if boxes[i].overlaps(&boxes[j]) {
                    let combined = boxes[i].merge_with(&boxes[j]);
                    boxes.swap_remove(j);
                    boxes[i] = combined;
                    merged = true;
                    break 'outer;
                }
            }
        }
    }
    boxes
}

/// Synthesize `alter_pixels` operations from merged PHI regions.
pub fn regions_to_ops(regions: &[OcrRegion], padding: u32) -> Vec<TagOp> {
    merge_regions(regions, padding)
        .into_iter()
        .map(|r| {
            TagOp::new(
                "PixelData",
                TagAction::AlterPixels {
                    x: r.x,
                    y: r.y,
                    w: r.w,
                    h: r.h,
                },
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    regions: Vec<OcrRegion>,
}

/// HTTP client of the OCR text-detection service.
pub struct OcrClient {
    url: String,
    client: reqwest::Client,
}

impl OcrClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::anonymization(format!("ocr client init failed: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// POST the object to the detection endpoint and return the reported
    /// regions with their PHI classification.
    pub async fn detect_regions(&self, file: &Path) -> Result<Vec<OcrRegion>, GatewayError> {
        let bytes = tokio::fs::read(file).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "object.dcm".into()),
            )
            .mime_str("application/dicom")
            .map_err(|e| GatewayError::anonymization(format!("ocr request build failed: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/detect", self.url.trim_end_matches('/')))
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::anonymization(format!("ocr request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::anonymization(format!(
                "ocr service returned {}",
                response.status()
            )));
        }
        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::anonymization(format!("bad ocr response: {}", e)))?;
        debug!(file = %file.display(), regions = body.regions.len(), "ocr detection complete");
        Ok(body.regions)
    }
}
