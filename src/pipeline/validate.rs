//! Strict parsing boundary between raw model text and typed facet output.
//!
//! Individual fields that fail validation are dropped and reported as
//! [`ValidationWarning`]s. Only when a facet's primary content is missing or
//! the payload is not JSON at all does normalization fail with a
//! [`ValidationError`], and then only for that facet.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::analysis::{
    ExecutiveSummary, FacetOutput, HotCategory, PlatformOutlook, PricingTrend, TrendDirection,
};
use super::prompts::{ExpectedShape, Facet};
use crate::llm::RawModelResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub facet: Facet,
    pub field: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(facet: Facet, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            facet,
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{facet} output is not valid JSON: {reason}")]
    Unparseable { facet: Facet, reason: String },

    #[error("{facet} output has no usable {field}")]
    MissingPrimary { facet: Facet, field: &'static str },
}

impl ValidationError {
    pub fn facet(&self) -> Facet {
        match self {
            ValidationError::Unparseable { facet, .. }
            | ValidationError::MissingPrimary { facet, .. } => *facet,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Unparseable { .. } => "unparseable-output",
            ValidationError::MissingPrimary { .. } => "missing-primary-content",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub output: FacetOutput,
    pub warnings: Vec<ValidationWarning>,
}

pub(crate) fn extract_json(content: &str) -> String {
    if let Some(start) = content.find("```json")
        && let Some(end) = content[start + 7..].find("```")
    {
        return content[start + 7..start + 7 + end].trim().to_string();
    }
    if let Some(start) = content.find("```")
        && let Some(end) = content[start + 3..].find("```")
    {
        let inner = content[start + 3..start + 3 + end].trim();
        if inner.starts_with('{') {
            return inner.to_string();
        }
    }
    if let Some(start) = content.find('{')
        && let Some(end) = content.rfind('}')
        && start < end
    {
        return content[start..=end].to_string();
    }
    content.to_string()
}

/// Parses one raw model response against the shape its prompt asked for.
pub fn normalize(
    raw: &RawModelResponse,
    shape: ExpectedShape,
) -> Result<Normalized, ValidationError> {
    let facet = raw.facet;
    let json = extract_json(&raw.content);
    let value: Value =
        serde_json::from_str(&json).map_err(|e| ValidationError::Unparseable {
            facet,
            reason: e.to_string(),
        })?;

    let mut warnings = Vec::new();
    let output = match shape {
        ExpectedShape::MarketSummary => {
            FacetOutput::Summary(parse_summary(facet, &value, &mut warnings)?)
        }
        ExpectedShape::PricingTrends => {
            FacetOutput::Pricing(parse_pricing(facet, &value, &mut warnings)?)
        }
        ExpectedShape::HotCategories => {
            FacetOutput::Categories(parse_categories(facet, &value, &mut warnings)?)
        }
        ExpectedShape::Predictions => {
            let technology_trends = string_list(
                facet,
                "technology_trends",
                value.get("technology_trends"),
                &mut warnings,
            );
            let strategy_suggestions = string_list(
                facet,
                "strategy_suggestions",
                value.get("strategy_suggestions"),
                &mut warnings,
            );
            if technology_trends.is_empty() && strategy_suggestions.is_empty() {
                return Err(ValidationError::MissingPrimary {
                    facet,
                    field: "technology_trends",
                });
            }
            FacetOutput::Predictions {
                technology_trends,
                strategy_suggestions,
                market_opportunities: string_list(
                    facet,
                    "market_opportunities",
                    value.get("market_opportunities"),
                    &mut warnings,
                ),
                seller_success_factors: string_list(
                    facet,
                    "seller_success_factors",
                    value.get("seller_success_factors"),
                    &mut warnings,
                ),
            }
        }
    };

    Ok(Normalized { output, warnings })
}

/// A finite number, or a numeric string with an optional trailing `%`.
fn parse_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn non_blank(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(
    facet: Facet,
    field: &str,
    value: Option<&Value>,
    warnings: &mut Vec<ValidationWarning>,
) -> Vec<String> {
    let items = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            warnings.push(ValidationWarning::new(facet, field, "expected a list; dropped"));
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match non_blank(Some(item)) {
            Some(text) => {
                if seen.insert(text.to_lowercase()) {
                    out.push(text);
                }
            }
            None => warnings.push(ValidationWarning::new(
                facet,
                format!("{field}[{i}]"),
                "not a non-empty string; dropped",
            )),
        }
    }
    out
}

fn parse_summary(
    facet: Facet,
    value: &Value,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<ExecutiveSummary, ValidationError> {
    let overview = non_blank(value.get("overview")).ok_or(ValidationError::MissingPrimary {
        facet,
        field: "overview",
    })?;
    let highlights = string_list(facet, "highlights", value.get("highlights"), warnings);
    let platform_outlook = parse_platform_outlook(facet, value.get("platform_outlook"), warnings);
    Ok(ExecutiveSummary {
        overview,
        highlights,
        platform_outlook,
    })
}

fn parse_platform_outlook(
    facet: Facet,
    value: Option<&Value>,
    warnings: &mut Vec<ValidationWarning>,
) -> Vec<PlatformOutlook> {
    let items = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            warnings.push(ValidationWarning::new(
                facet,
                "platform_outlook",
                "expected a list; dropped",
            ));
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let field = format!("platform_outlook[{i}]");
        let Some(platform) = non_blank(item.get("platform")) else {
            warnings.push(ValidationWarning::new(facet, field, "missing platform name; dropped"));
            continue;
        };
        let raw_growth = item.get("growth").and_then(Value::as_str).unwrap_or("");
        let Some(growth) = TrendDirection::parse(raw_growth) else {
            warnings.push(ValidationWarning::new(
                facet,
                format!("{field}.growth"),
                format!("unknown growth {raw_growth:?} for {platform:?}; dropped"),
            ));
            continue;
        };
        if !seen.insert(platform.to_lowercase()) {
            warnings.push(ValidationWarning::new(
                facet,
                field,
                format!("duplicate outlook for {platform:?}; kept the first"),
            ));
            continue;
        }
        out.push(PlatformOutlook {
            platform,
            growth,
            focus: non_blank(item.get("focus")),
        });
    }
    out
}

fn parse_categories(
    facet: Facet,
    value: &Value,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<Vec<HotCategory>, ValidationError> {
    let items = value
        .get("hot_categories")
        .or(Some(value))
        .and_then(Value::as_array)
        .ok_or(ValidationError::MissingPrimary {
            facet,
            field: "hot_categories",
        })?;

    let mut categories: Vec<HotCategory> = Vec::new();
    let mut index_by_name: HashMap<String, usize> = HashMap::new();

    for (i, item) in items.iter().enumerate() {
        let field = format!("hot_categories[{i}]");
        let Some(name) = non_blank(item.get("name")) else {
            warnings.push(ValidationWarning::new(facet, field, "missing category name; dropped"));
            continue;
        };
        let Some(raw_confidence) = item.get("confidence").and_then(parse_number) else {
            warnings.push(ValidationWarning::new(
                facet,
                format!("{field}.confidence"),
                format!("confidence for {name:?} is not a number; dropped"),
            ));
            continue;
        };
        let confidence = raw_confidence.clamp(0.0, 1.0);
        if confidence != raw_confidence {
            warnings.push(ValidationWarning::new(
                facet,
                format!("{field}.confidence"),
                format!("confidence {raw_confidence} for {name:?} clamped to {confidence}"),
            ));
        }

        match index_by_name.get(&name.to_lowercase()) {
            Some(&existing) => {
                warnings.push(ValidationWarning::new(
                    facet,
                    field,
                    format!("duplicate category {name:?}; kept the highest confidence"),
                ));
                if confidence > categories[existing].confidence {
                    categories[existing].confidence = confidence;
                }
            }
            None => {
                index_by_name.insert(name.to_lowercase(), categories.len());
                categories.push(HotCategory { name, confidence });
            }
        }
    }

    if categories.is_empty() {
        return Err(ValidationError::MissingPrimary {
            facet,
            field: "hot_categories",
        });
    }

    // stable: ties keep first appearance
    categories.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(categories)
}

fn parse_trend(
    facet: Facet,
    field: &str,
    name: &str,
    item: &Value,
    warnings: &mut Vec<ValidationWarning>,
) -> Option<PricingTrend> {
    let raw_direction = item.get("direction").and_then(Value::as_str).unwrap_or("");
    let Some(direction) = TrendDirection::parse(raw_direction) else {
        warnings.push(ValidationWarning::new(
            facet,
            format!("{field}.direction"),
            format!("unknown direction {raw_direction:?} for {name:?}; dropped"),
        ));
        return None;
    };

    let magnitude_percent = match item.get("magnitude_percent") {
        None | Some(Value::Null) => {
            warnings.push(ValidationWarning::new(
                facet,
                format!("{field}.magnitude_percent"),
                format!("missing magnitude for {name:?}; defaulted to 0"),
            ));
            0.0
        }
        Some(raw) => match parse_number(raw) {
            Some(n) => n,
            None => {
                warnings.push(ValidationWarning::new(
                    facet,
                    format!("{field}.magnitude_percent"),
                    format!("magnitude for {name:?} is not a number; defaulted to 0"),
                ));
                0.0
            }
        },
    };

    // Stored unsigned. A negative figure on a rising trend keeps the direction.
    if direction == TrendDirection::Up && magnitude_percent < 0.0 {
        warnings.push(ValidationWarning::new(
            facet,
            format!("{field}.magnitude_percent"),
            format!(
                "magnitude {magnitude_percent} for {name:?} contradicts direction {direction}; \
                 kept as {}",
                magnitude_percent.abs()
            ),
        ));
    }

    Some(PricingTrend {
        direction,
        magnitude_percent: magnitude_percent.abs(),
    })
}

fn parse_pricing(
    facet: Facet,
    value: &Value,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<BTreeMap<String, PricingTrend>, ValidationError> {
    let missing = ValidationError::MissingPrimary {
        facet,
        field: "pricing_trends",
    };

    // Either a list of {category, ...} entries or a map keyed by category.
    let entries: Vec<(String, Option<String>, &Value)> = match value.get("pricing_trends") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let name = non_blank(item.get("category"));
                (format!("pricing_trends[{i}]"), name, item)
            })
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, item)| {
                let name = Some(k.trim().to_string()).filter(|n| !n.is_empty());
                (format!("pricing_trends.{k}"), name, item)
            })
            .collect(),
        _ => return Err(missing),
    };

    let mut trends = BTreeMap::new();
    let mut seen = HashSet::new();
    for (field, name, item) in entries {
        let Some(name) = name else {
            warnings.push(ValidationWarning::new(facet, field, "missing category name; dropped"));
            continue;
        };
        if !seen.insert(name.to_lowercase()) {
            warnings.push(ValidationWarning::new(
                facet,
                field,
                format!("duplicate pricing entry for {name:?}; kept the first"),
            ));
            continue;
        }
        if let Some(trend) = parse_trend(facet, &field, &name, item, warnings) {
            trends.insert(name, trend);
        }
    }

    if trends.is_empty() {
        return Err(missing);
    }
    Ok(trends)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(facet: Facet, content: &str) -> RawModelResponse {
        RawModelResponse {
            facet,
            content: content.to_string(),
            model: "test-model".to_string(),
            provider: "test".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            attempts: 1,
        }
    }

    fn categories(normalized: Normalized) -> Vec<HotCategory> {
        match normalized.output {
            FacetOutput::Categories(c) => c,
            other => panic!("expected categories, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_json_raw() {
        let input = r#"{"hot_categories": [], "note": "test"}"#;
        let result = extract_json(input);
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["note"], "test");
    }

    #[test]
    fn test_extract_json_markdown_block() {
        let input = "Here is the analysis:\n```json\n{\"overview\": \"x\"}\n```\nDone.";
        assert_eq!(extract_json(input), "{\"overview\": \"x\"}");
    }

    #[test]
    fn test_extract_json_generic_fence() {
        let input = "```\n{\"overview\": \"x\"}\n```";
        assert_eq!(extract_json(input), "{\"overview\": \"x\"}");
    }

    #[test]
    fn test_extract_json_surrounding_prose() {
        let input = "Sure! {\"overview\": \"x\"} Hope this helps.";
        assert_eq!(extract_json(input), "{\"overview\": \"x\"}");
    }

    #[test]
    fn test_confidence_clamped_with_warning() {
        let response = raw(
            Facet::Categories,
            r#"{"hot_categories": [{"name": "Notion Templates", "confidence": 1.7}]}"#,
        );
        let normalized = normalize(&response, ExpectedShape::HotCategories).unwrap();
        assert_eq!(normalized.warnings.len(), 1);
        assert!(normalized.warnings[0].message.contains("clamped"));

        let cats = categories(normalized);
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].confidence, 1.0);
    }

    #[test]
    fn test_negative_confidence_clamped_to_zero() {
        let response = raw(
            Facet::Categories,
            r#"{"hot_categories": [{"name": "Fonts", "confidence": "-0.2"}]}"#,
        );
        let cats = categories(normalize(&response, ExpectedShape::HotCategories).unwrap());
        assert_eq!(cats[0].confidence, 0.0);
    }

    #[test]
    fn test_duplicates_keep_highest_confidence() {
        let response = raw(
            Facet::Categories,
            r#"{"hot_categories": [
                {"name": "AI Tools", "confidence": 0.6},
                {"name": "Planners", "confidence": 0.7},
                {"name": "ai tools", "confidence": 0.9}
            ]}"#,
        );
        let normalized = normalize(&response, ExpectedShape::HotCategories).unwrap();
        assert_eq!(normalized.warnings.len(), 1);

        let cats = categories(normalized);
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].name, "AI Tools");
        assert_eq!(cats[0].confidence, 0.9);
        assert_eq!(cats[1].name, "Planners");
    }

    #[test]
    fn test_bad_entries_dropped_not_fatal() {
        let response = raw(
            Facet::Categories,
            r#"{"hot_categories": [
                {"name": "", "confidence": 0.5},
                {"name": "Courses", "confidence": "high"},
                {"name": "Stickers", "confidence": 0.4}
            ]}"#,
        );
        let normalized = normalize(&response, ExpectedShape::HotCategories).unwrap();
        assert_eq!(normalized.warnings.len(), 2);
        assert_eq!(categories(normalized).len(), 1);
    }

    #[test]
    fn test_empty_category_list_is_fatal_for_facet() {
        let response = raw(Facet::Categories, r#"{"hot_categories": []}"#);
        let err = normalize(&response, ExpectedShape::HotCategories).unwrap_err();
        assert_eq!(err.code(), "missing-primary-content");
    }

    #[test]
    fn test_non_json_is_unparseable() {
        let response = raw(Facet::Summary, "The market is doing great this year.");
        let err = normalize(&response, ExpectedShape::MarketSummary).unwrap_err();
        assert!(matches!(err, ValidationError::Unparseable { facet: Facet::Summary, .. }));
    }

    #[test]
    fn test_pricing_directions_and_magnitudes() {
        let response = raw(
            Facet::Pricing,
            r#"```json
            {"pricing_trends": [
                {"category": "Notion Templates", "direction": "rising", "magnitude_percent": "12.5%"},
                {"category": "Stock Photos", "direction": "down"},
                {"category": "Fonts", "direction": "sideways", "magnitude_percent": 3}
            ]}
            ```"#,
        );
        let normalized = normalize(&response, ExpectedShape::PricingTrends).unwrap();
        // missing magnitude + unknown direction
        assert_eq!(normalized.warnings.len(), 2);

        let FacetOutput::Pricing(trends) = normalized.output else {
            panic!("expected pricing output");
        };
        assert_eq!(trends.len(), 2);
        assert_eq!(trends["Notion Templates"].direction, TrendDirection::Up);
        assert_eq!(trends["Notion Templates"].magnitude_percent, 12.5);
        assert_eq!(trends["Stock Photos"].magnitude_percent, 0.0);
    }

    #[test]
    fn test_pricing_magnitude_stored_unsigned() {
        let response = raw(
            Facet::Pricing,
            r#"{"pricing_trends": [
                {"category": "Fonts", "direction": "down", "magnitude_percent": 8},
                {"category": "Stock Photos", "direction": "down", "magnitude_percent": "-4%"},
                {"category": "Planners", "direction": "up", "magnitude_percent": -6}
            ]}"#,
        );
        let normalized = normalize(&response, ExpectedShape::PricingTrends).unwrap();
        assert_eq!(normalized.warnings.len(), 1);
        assert_eq!(
            normalized.warnings[0].field,
            "pricing_trends[2].magnitude_percent"
        );

        let FacetOutput::Pricing(trends) = normalized.output else {
            panic!("expected pricing output");
        };
        assert_eq!(trends["Fonts"].magnitude_percent, 8.0);
        assert_eq!(trends["Fonts"].signed_percent(), -8.0);
        assert_eq!(trends["Stock Photos"].magnitude_percent, 4.0);
        assert_eq!(trends["Planners"].direction, TrendDirection::Up);
        assert_eq!(trends["Planners"].magnitude_percent, 6.0);
    }

    #[test]
    fn test_pricing_accepts_mapping_form() {
        let response = raw(
            Facet::Pricing,
            r#"{"pricing_trends": {"Fonts": {"direction": "flat", "magnitude_percent": 0}}}"#,
        );
        let normalized = normalize(&response, ExpectedShape::PricingTrends).unwrap();
        assert!(normalized.warnings.is_empty());
    }

    #[test]
    fn test_summary_requires_overview() {
        let response = raw(Facet::Summary, r#"{"overview": "  ", "highlights": ["a"]}"#);
        let err = normalize(&response, ExpectedShape::MarketSummary).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingPrimary {
                facet: Facet::Summary,
                field: "overview"
            }
        );
    }

    #[test]
    fn test_predictions_lists_cleaned() {
        let response = raw(
            Facet::Predictions,
            r#"{"technology_trends": ["AR previews", "", "AR previews", 7],
                "strategy_suggestions": ["Bundle products"]}"#,
        );
        let normalized = normalize(&response, ExpectedShape::Predictions).unwrap();
        assert_eq!(normalized.warnings.len(), 2);
        let FacetOutput::Predictions {
            technology_trends,
            strategy_suggestions,
            market_opportunities,
            seller_success_factors,
        } = normalized.output
        else {
            panic!("expected predictions output");
        };
        assert_eq!(technology_trends, vec!["AR previews"]);
        assert_eq!(strategy_suggestions, vec!["Bundle products"]);
        assert!(market_opportunities.is_empty());
        assert!(seller_success_factors.is_empty());
    }

    #[test]
    fn test_predictions_carry_opportunities_and_success_factors() {
        let response = raw(
            Facet::Predictions,
            r#"{"technology_trends": ["AI personalization"],
                "strategy_suggestions": ["Bundle products"],
                "market_opportunities": ["Localized planners", " "],
                "seller_success_factors": "consistent branding"}"#,
        );
        let normalized = normalize(&response, ExpectedShape::Predictions).unwrap();
        // blank opportunity + success factors not a list
        assert_eq!(normalized.warnings.len(), 2);
        assert_eq!(normalized.warnings[1].field, "seller_success_factors");

        let FacetOutput::Predictions {
            market_opportunities,
            seller_success_factors,
            ..
        } = normalized.output
        else {
            panic!("expected predictions output");
        };
        assert_eq!(market_opportunities, vec!["Localized planners"]);
        assert!(seller_success_factors.is_empty());
    }

    #[test]
    fn test_opportunities_alone_do_not_count_as_predictions() {
        let response = raw(
            Facet::Predictions,
            r#"{"market_opportunities": ["Localized planners"]}"#,
        );
        let err = normalize(&response, ExpectedShape::Predictions).unwrap_err();
        assert_eq!(err.facet(), Facet::Predictions);
        assert_eq!(err.code(), "missing-primary-content");
    }

    #[test]
    fn test_summary_platform_outlook() {
        let response = raw(
            Facet::Summary,
            r#"{"overview": "Growth continues.",
                "platform_outlook": [
                    {"platform": "Etsy", "growth": "rising", "focus": "Printables"},
                    {"platform": "Gumroad", "growth": "sideways"},
                    {"platform": "etsy", "growth": "down"},
                    {"growth": "up"}
                ]}"#,
        );
        let normalized = normalize(&response, ExpectedShape::MarketSummary).unwrap();
        // unknown growth + duplicate + missing platform
        assert_eq!(normalized.warnings.len(), 3);

        let FacetOutput::Summary(summary) = normalized.output else {
            panic!("expected summary output");
        };
        assert_eq!(
            summary.platform_outlook,
            vec![PlatformOutlook {
                platform: "Etsy".to_string(),
                growth: TrendDirection::Up,
                focus: Some("Printables".to_string()),
            }]
        );
    }

    #[test]
    fn test_predictions_need_some_content() {
        let response = raw(
            Facet::Predictions,
            r#"{"technology_trends": [], "strategy_suggestions": null}"#,
        );
        assert!(normalize(&response, ExpectedShape::Predictions).is_err());
    }
}
