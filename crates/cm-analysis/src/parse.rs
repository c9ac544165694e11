//! Turns free-form model output into a validated analysis. Enumerated fields
//! are strict; list fields default to empty.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

use cm_core::model::{
    AnalysisReport, ComplianceStatus, DetectedLanguage, KeyTerm, KeyTermImportance, RiskScore,
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object in model response")]
    NoJson,
    #[error("model response is not a valid analysis: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnalysis {
    pub detected_language: DetectedLanguage,
    pub risk_score: RiskScore,
    pub sharia_compliance: ComplianceStatus,
    pub ksa_compliance: ComplianceStatus,
    pub report: AnalysisReport,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    risk_score: RiskScore,
    #[serde(default)]
    risk_factors: Vec<String>,
    sharia_compliance: ComplianceStatus,
    #[serde(default)]
    sharia_issues: Vec<String>,
    ksa_compliance: ComplianceStatus,
    #[serde(default)]
    ksa_issues: Vec<String>,
    #[serde(default)]
    key_terms: Vec<RawKeyTerm>,
    #[serde(default)]
    recommendations: Vec<String>,
    detected_language: DetectedLanguage,
}

#[derive(Deserialize)]
struct RawKeyTerm {
    #[serde(default)]
    term: String,
    #[serde(default)]
    definition: String,
    #[serde(default)]
    importance: Option<String>,
}

fn json_object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("json object pattern"))
}

/// Spans from the first `{` to the last `}`, which tolerates markdown fences
/// and prose around the object.
pub fn extract_json_object(response: &str) -> Option<&str> {
    json_object_pattern().find(response).map(|found| found.as_str())
}

pub fn parse_analysis(response: &str) -> Result<ParsedAnalysis, ParseError> {
    let object = extract_json_object(response).ok_or(ParseError::NoJson)?;
    let raw: RawAnalysis = serde_json::from_str(object)?;
    let key_terms = raw
        .key_terms
        .into_iter()
        .filter(|term| !term.term.trim().is_empty())
        .map(|term| KeyTerm {
            term: term.term,
            definition: term.definition,
            importance: term
                .importance
                .and_then(|value| value.trim().to_ascii_lowercase().parse::<KeyTermImportance>().ok()),
        })
        .collect();
    Ok(ParsedAnalysis {
        detected_language: raw.detected_language,
        risk_score: raw.risk_score,
        sharia_compliance: raw.sharia_compliance,
        ksa_compliance: raw.ksa_compliance,
        report: AnalysisReport {
            summary: raw.summary,
            risk_factors: raw.risk_factors,
            sharia_issues: raw.sharia_issues,
            ksa_issues: raw.ksa_issues,
            key_terms,
            recommendations: raw.recommendations,
        },
    })
}
