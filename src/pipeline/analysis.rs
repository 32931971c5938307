use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prompts::Facet;
use super::request::{AnalysisRequest, Depth};
use super::validate::{ValidationError, ValidationWarning};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotCategory {
    pub name: String,
    /// Always within `[0, 1]` once normalized.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl TrendDirection {
    /// Accepts the canonical names and the synonyms models tend to use.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "up" | "increasing" | "rising" => Some(TrendDirection::Up),
            "down" | "decreasing" | "falling" => Some(TrendDirection::Down),
            "flat" | "stable" | "steady" => Some(TrendDirection::Flat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrendDirection::Up => "up",
            TrendDirection::Down => "down",
            TrendDirection::Flat => "flat",
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTrend {
    pub direction: TrendDirection,
    /// Size of the move, never negative. The sign lives in `direction`.
    pub magnitude_percent: f64,
}

impl PricingTrend {
    /// Magnitude with the sign implied by the direction.
    pub fn signed_percent(&self) -> f64 {
        match self.direction {
            TrendDirection::Down => -self.magnitude_percent,
            TrendDirection::Up | TrendDirection::Flat => self.magnitude_percent,
        }
    }
}

/// Where one requested platform is heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformOutlook {
    pub platform: String,
    pub growth: TrendDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub overview: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    /// Only platforms named in the request survive assembly.
    #[serde(default)]
    pub platform_outlook: Vec<PlatformOutlook>,
}

/// Normalized content of one facet, before assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum FacetOutput {
    Summary(ExecutiveSummary),
    Pricing(BTreeMap<String, PricingTrend>),
    Categories(Vec<HotCategory>),
    Predictions {
        technology_trends: Vec<String>,
        strategy_suggestions: Vec<String>,
        market_opportunities: Vec<String>,
        seller_success_factors: Vec<String>,
    },
}

impl FacetOutput {
    pub fn facet(&self) -> Facet {
        match self {
            FacetOutput::Summary(_) => Facet::Summary,
            FacetOutput::Pricing(_) => Facet::Pricing,
            FacetOutput::Categories(_) => Facet::Categories,
            FacetOutput::Predictions { .. } => Facet::Predictions,
        }
    }
}

/// The canonical analysis every downstream stage reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<ExecutiveSummary>,
    #[serde(default)]
    pub hot_categories: Vec<HotCategory>,
    #[serde(default)]
    pub pricing_trends: BTreeMap<String, PricingTrend>,
    #[serde(default)]
    pub technology_trends: Vec<String>,
    #[serde(default)]
    pub strategy_suggestions: Vec<String>,
    #[serde(default)]
    pub market_opportunities: Vec<String>,
    #[serde(default)]
    pub seller_success_factors: Vec<String>,
    #[serde(default)]
    pub depth: Depth,
    pub horizon_months: u32,
    /// Facets that contributed, in facet order.
    #[serde(default)]
    pub coverage: Vec<Facet>,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn is_complete(&self) -> bool {
        Facet::ALL.iter().all(|f| self.coverage.contains(f))
    }

    /// Checks the invariants the renderer relies on.
    pub fn check_invariants(&self, request: &AnalysisRequest) -> Result<(), String> {
        if let Some(bad) = self
            .hot_categories
            .iter()
            .find(|c| !(0.0..=1.0).contains(&c.confidence))
        {
            return Err(format!(
                "confidence {} for {:?} is outside [0, 1]",
                bad.confidence, bad.name
            ));
        }
        let catalog = catalog(request, &self.hot_categories);
        if let Some(orphan) = self
            .pricing_trends
            .keys()
            .find(|k| !catalog.contains_key(&k.to_lowercase()))
        {
            return Err(format!("pricing trend for unknown category {orphan:?}"));
        }
        if let Some((name, trend)) = self
            .pricing_trends
            .iter()
            .find(|(_, t)| t.magnitude_percent < 0.0)
        {
            return Err(format!(
                "magnitude {} for {name:?} is negative",
                trend.magnitude_percent
            ));
        }
        if self.pricing_trends.is_empty() == self.coverage.contains(&Facet::Pricing) {
            return Err("pricing coverage does not match pricing trends".to_string());
        }
        let requested = |name: &str| {
            request
                .platforms
                .iter()
                .any(|p| p.trim().eq_ignore_ascii_case(name))
        };
        if let Some(outlook) = self
            .executive_summary
            .iter()
            .flat_map(|s| &s.platform_outlook)
            .find(|o| !requested(&o.platform))
        {
            return Err(format!("outlook for unrequested platform {:?}", outlook.platform));
        }
        Ok(())
    }
}

/// Known categories keyed by lowercase name, mapped to their display spelling.
/// Request categories win over model-proposed spellings.
fn catalog(
    request: &AnalysisRequest,
    hot_categories: &[HotCategory],
) -> HashMap<String, String> {
    let mut known = HashMap::new();
    for name in request
        .categories
        .iter()
        .map(|c| c.trim())
        .chain(hot_categories.iter().map(|c| c.name.as_str()))
    {
        known
            .entry(name.to_lowercase())
            .or_insert_with(|| name.to_string());
    }
    known
}

/// Outcome of folding facet outputs together.
#[derive(Debug)]
pub struct Assembly {
    /// `None` when no facet contributed.
    pub analysis: Option<AnalysisResult>,
    /// Facets that parsed but were left with nothing once cross-facet
    /// checks ran. They are not counted in coverage.
    pub rejected: Vec<ValidationError>,
}

/// Folds per-facet outputs into one result.
pub fn assemble(
    request: &AnalysisRequest,
    outputs: Vec<FacetOutput>,
    generated_at: DateTime<Utc>,
    warnings: &mut Vec<ValidationWarning>,
) -> Assembly {
    let mut rejected = Vec::new();
    if outputs.is_empty() {
        return Assembly {
            analysis: None,
            rejected,
        };
    }

    let mut result = AnalysisResult {
        executive_summary: None,
        hot_categories: Vec::new(),
        pricing_trends: BTreeMap::new(),
        technology_trends: Vec::new(),
        strategy_suggestions: Vec::new(),
        market_opportunities: Vec::new(),
        seller_success_factors: Vec::new(),
        depth: request.depth,
        horizon_months: request.horizon_months,
        coverage: Vec::new(),
        generated_at,
    };
    let mut pricing = BTreeMap::new();

    for output in outputs {
        result.coverage.push(output.facet());
        match output {
            FacetOutput::Summary(summary) => {
                result.executive_summary =
                    Some(keep_requested_platforms(request, summary, warnings));
            }
            FacetOutput::Pricing(trends) => pricing = trends,
            FacetOutput::Categories(categories) => result.hot_categories = categories,
            FacetOutput::Predictions {
                technology_trends,
                strategy_suggestions,
                market_opportunities,
                seller_success_factors,
            } => {
                result.technology_trends = technology_trends;
                result.strategy_suggestions = strategy_suggestions;
                result.market_opportunities = market_opportunities;
                result.seller_success_factors = seller_success_factors;
            }
        }
    }
    result.coverage.sort();
    result.coverage.dedup();

    let known = catalog(request, &result.hot_categories);
    for (name, trend) in pricing {
        match known.get(&name.to_lowercase()) {
            Some(canonical) => {
                result.pricing_trends.insert(canonical.clone(), trend);
            }
            None => warnings.push(ValidationWarning::new(
                Facet::Pricing,
                format!("pricing_trends.{name}"),
                "category is not in the known catalog; dropped",
            )),
        }
    }

    if result.pricing_trends.is_empty() && result.coverage.contains(&Facet::Pricing) {
        result.coverage.retain(|f| *f != Facet::Pricing);
        rejected.push(ValidationError::MissingPrimary {
            facet: Facet::Pricing,
            field: "pricing_trends",
        });
    }

    let analysis = (!result.coverage.is_empty()).then_some(result);
    Assembly { analysis, rejected }
}

/// Drops outlook entries for platforms the request did not name and
/// restores the request's spelling on the rest.
fn keep_requested_platforms(
    request: &AnalysisRequest,
    mut summary: ExecutiveSummary,
    warnings: &mut Vec<ValidationWarning>,
) -> ExecutiveSummary {
    let outlook = std::mem::take(&mut summary.platform_outlook);
    for mut entry in outlook {
        let requested = request
            .platforms
            .iter()
            .map(|p| p.trim())
            .find(|p| p.eq_ignore_ascii_case(entry.platform.trim()));
        match requested {
            Some(name) => {
                entry.platform = name.to_string();
                summary.platform_outlook.push(entry);
            }
            None => warnings.push(ValidationWarning::new(
                Facet::Summary,
                format!("platform_outlook.{}", entry.platform),
                "platform was not requested; dropped",
            )),
        }
    }
    summary
}
