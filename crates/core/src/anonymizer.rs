//! Best-effort redaction of sensitive spans.
//!
//! Detection is a capability interface, [`SpanDetector`], with one detector
//! per [`RedactionCategory`]. A failing detector never blocks ingestion: its
//! category is left unredacted and the failure is reported so the caller can
//! flag the document for manual review.

use crate::extractor::PageText;
use crate::models::{RedactionCategory, RedactionSpan};
use regex::Regex;
use std::fmt;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedSpan {
    pub start: usize,
    pub end: usize,
    pub category: RedactionCategory,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{detector} detector failed: {reason}")]
pub struct DetectorError {
    pub detector: String,
    pub reason: String,
}

pub trait SpanDetector: Send + Sync {
    fn category(&self) -> RedactionCategory;

    fn detect_spans(&self, text: &str) -> Result<Vec<DetectedSpan>, DetectorError>;
}

/// Regex-backed detector with an optional post-match validator.
pub struct PatternDetector {
    category: RedactionCategory,
    pattern: Result<Regex, String>,
    validator: Option<fn(&str) -> bool>,
}

impl fmt::Debug for PatternDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternDetector")
            .field("category", &self.category)
            .field("compiled", &self.pattern.is_ok())
            .finish()
    }
}

impl PatternDetector {
    fn builtin(category: RedactionCategory, pattern: &str, validator: Option<fn(&str) -> bool>) -> Self {
        Self {
            category,
            pattern: Regex::new(pattern).map_err(|error| error.to_string()),
            validator,
        }
    }

    pub fn email() -> Self {
        Self::builtin(
            RedactionCategory::Email,
            r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
            None,
        )
    }

    pub fn phone() -> Self {
        Self::builtin(
            RedactionCategory::Phone,
            r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.-])\d{3}[\s.-]\d{4}\b",
            None,
        )
    }

    pub fn credit_card() -> Self {
        Self::builtin(
            RedactionCategory::CreditCard,
            r"\b(?:\d[ -]?){12,18}\d\b",
            Some(passes_luhn),
        )
    }

    pub fn ip_address() -> Self {
        Self::builtin(
            RedactionCategory::IpAddress,
            r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
            None,
        )
    }

    pub fn national_id() -> Self {
        Self::builtin(
            RedactionCategory::NationalId,
            r"\b\d{3}-\d{2}-\d{4}\b",
            None,
        )
    }

    /// Operator-configured pattern. An invalid pattern yields a detector
    /// that reports failure on every call instead of failing construction.
    pub fn custom(name: impl Into<String>, pattern: &str) -> Self {
        Self {
            category: RedactionCategory::Custom(name.into()),
            pattern: Regex::new(pattern).map_err(|error| error.to_string()),
            validator: None,
        }
    }
}

impl SpanDetector for PatternDetector {
    fn category(&self) -> RedactionCategory {
        self.category.clone()
    }

    fn detect_spans(&self, text: &str) -> Result<Vec<DetectedSpan>, DetectorError> {
        let regex = self.pattern.as_ref().map_err(|reason| DetectorError {
            detector: self.category.label(),
            reason: reason.clone(),
        })?;

        Ok(regex
            .find_iter(text)
            .filter(|found| self.validator.map_or(true, |valid| valid(found.as_str())))
            .map(|found| DetectedSpan {
                start: found.start(),
                end: found.end(),
                category: self.category.clone(),
            })
            .collect())
    }
}

fn passes_luhn(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(position, digit)| {
            if position % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                *digit
            }
        })
        .sum();

    sum % 10 == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymizedText {
    pub pages: Vec<PageText>,
    pub spans: Vec<RedactionSpan>,
    /// One entry per detector failure; non-empty means the text may be unredacted.
    pub failures: Vec<String>,
}

impl AnonymizedText {
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.spans.iter().map(|span| span.category.label()).collect();
        labels.sort();
        labels.dedup();
        labels
    }
}

pub struct Anonymizer {
    detectors: Vec<Box<dyn SpanDetector>>,
}

impl fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anonymizer")
            .field("detectors", &self.detectors.len())
            .finish()
    }
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::with_default_detectors()
    }
}

impl Anonymizer {
    pub fn new(detectors: Vec<Box<dyn SpanDetector>>) -> Self {
        Self { detectors }
    }

    /// Card numbers run before phone numbers so overlapping digits resolve
    /// to the more specific category.
    pub fn with_default_detectors() -> Self {
        Self::new(vec![
            Box::new(PatternDetector::email()),
            Box::new(PatternDetector::credit_card()),
            Box::new(PatternDetector::national_id()),
            Box::new(PatternDetector::phone()),
            Box::new(PatternDetector::ip_address()),
        ])
    }

    pub fn with_detector(mut self, detector: Box<dyn SpanDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn anonymize_pages(&self, pages: &[PageText]) -> AnonymizedText {
        let mut result = AnonymizedText::default();

        for page in pages {
            let mut detected = Vec::new();
            for detector in &self.detectors {
                match detector.detect_spans(&page.text) {
                    Ok(spans) => detected.extend(spans),
                    Err(error) => {
                        warn!(page = page.number, error = %error, "redaction detector failed");
                        let message = error.to_string();
                        if !result.failures.contains(&message) {
                            result.failures.push(message);
                        }
                    }
                }
            }

            let merged = merge_spans(detected);
            result.pages.push(PageText {
                number: page.number,
                text: redact(&page.text, &merged),
            });
            result.spans.extend(merged.into_iter().map(|span| RedactionSpan {
                page: page.number,
                start: span.start,
                end: span.end,
                category: span.category,
            }));
        }

        result
    }
}

/// Sorts by start and folds overlapping spans into the earliest one.
fn merge_spans(mut spans: Vec<DetectedSpan>) -> Vec<DetectedSpan> {
    spans.sort_by(|left, right| {
        left.start
            .cmp(&right.start)
            .then_with(|| right.end.cmp(&left.end))
    });

    let mut merged: Vec<DetectedSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start < last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Replaces each merged span with a `[REDACTED:CATEGORY]` marker.
pub fn redact(text: &str, spans: &[DetectedSpan]) -> String {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        if span.start < cursor || span.end > text.len() {
            continue;
        }
        output.push_str(&text[cursor..span.start]);
        output.push_str("[REDACTED:");
        output.push_str(&span.category.label());
        output.push(']');
        cursor = span.end;
    }
    output.push_str(&text[cursor..]);
    output
}
