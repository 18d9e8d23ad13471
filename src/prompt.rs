//! OCR results, prompt construction and verdict parsing.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::traits::TextRecognizer;

/// Text reported when OCR found nothing in an image.
pub const NO_TEXT_DETECTED: &str = "No text detected";

/// Text reported when OCR could not process an image.
pub const FAILED_TO_PROCESS: &str = "Failed to process image";

/// Verdict line the model is asked to start its answer with.
pub const VERDICT_FORMAT: &str = "🔍 SAFETY VERDICT: [SAFE ✅ / CAUTION ⚠️ / NOT SAFE ❌]";

/// Result of recognizing one label image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum OcrOutcome {
    /// Recognized lines, newline-joined in detection order.
    Text(String),
    NoTextDetected,
    /// Recognition failed; the detail is for logs only.
    Failed(String),
}

impl OcrOutcome {
    /// Join recognized lines in detection order. Blank lines are dropped;
    /// no lines at all means nothing was detected.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = lines
            .into_iter()
            .filter_map(|line| {
                let line = line.as_ref().trim();
                (!line.is_empty()).then(|| line.to_string())
            })
            .collect::<Vec<_>>()
            .join("\n");
        if joined.is_empty() {
            Self::NoTextDetected
        } else {
            Self::Text(joined)
        }
    }

    /// Interpret raw recognizer output, mapping the sentinel strings back.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "" | NO_TEXT_DETECTED => Self::NoTextDetected,
            FAILED_TO_PROCESS => Self::Failed(FAILED_TO_PROCESS.to_string()),
            text => Self::from_lines(text.lines()),
        }
    }

    /// Recognized text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for OcrOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::NoTextDetected => f.write_str(NO_TEXT_DETECTED),
            Self::Failed(_) => f.write_str(FAILED_TO_PROCESS),
        }
    }
}

/// Recognize each image in order. Outcomes line up with `images`.
pub async fn recognize_all<I>(recognizer: &dyn TextRecognizer, images: &[I]) -> Vec<OcrOutcome>
where
    I: AsRef<[u8]> + Sync,
{
    let mut outcomes = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let outcome = recognizer.recognize(image.as_ref()).await;
        debug!(image = index + 1, detected = outcome.text().is_some(), "image recognized");
        outcomes.push(outcome);
    }
    outcomes
}

/// Per-image blocks: `Image N ingredients:` followed by the text, or
/// `Image N: No ingredients detected`.
pub fn ingredient_blocks(outcomes: &[OcrOutcome]) -> String {
    outcomes
        .iter()
        .enumerate()
        .map(|(i, outcome)| match outcome.text() {
            Some(text) => format!("Image {} ingredients:\n{}", i + 1, text),
            None => format!("Image {}: No ingredients detected", i + 1),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the single analysis prompt for a profile summary and OCR results.
pub fn build_analysis_prompt(profile_summary: &str, outcomes: &[OcrOutcome]) -> String {
    format!(
        "You are a food safety assistant. Check the ingredients below against the user's \
         health profile.\n\
         \n\
         User profile:\n\
         {profile}\n\
         \n\
         {blocks}\n\
         \n\
         Answer in exactly this format:\n\
         {VERDICT_FORMAT}\n\
         Reasons:\n\
         - one short line per ingredient or concern that affects the verdict",
        profile = profile_summary.trim(),
        blocks = ingredient_blocks(outcomes),
    )
}

/// Verdict parsed from a model answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyVerdict {
    Safe,
    Caution,
    NotSafe,
}

impl SafetyVerdict {
    /// Find the verdict line in `response`. `None` when the model did not
    /// follow the format or echoed the template unchanged.
    pub fn from_response(response: &str) -> Option<Self> {
        let line = response
            .lines()
            .find(|line| line.to_uppercase().contains("SAFETY VERDICT"))?;
        let value = line.split_once(':').map(|(_, v)| v).unwrap_or(line);
        let upper = value.to_uppercase();

        let candidates = [
            (Self::NotSafe, upper.contains("NOT SAFE") || value.contains('❌')),
            (Self::Caution, upper.contains("CAUTION") || value.contains('⚠')),
            (
                Self::Safe,
                upper.replace("NOT SAFE", "").contains("SAFE") || value.contains('✅'),
            ),
        ];
        let mut matched = candidates.iter().filter(|(_, hit)| *hit);
        let (verdict, _) = matched.next()?;
        if matched.next().is_some() {
            return None;
        }
        Some(*verdict)
    }

    /// Lines of the `Reasons:` section with list markers stripped.
    pub fn reasons(response: &str) -> Vec<String> {
        response
            .lines()
            .skip_while(|line| !line.trim().to_uppercase().starts_with("REASONS"))
            .skip(1)
            .map(|line| line.trim().trim_start_matches(['-', '•', '*']).trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE ✅",
            Self::Caution => "CAUTION ⚠️",
            Self::NotSafe => "NOT SAFE ❌",
        }
    }
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
