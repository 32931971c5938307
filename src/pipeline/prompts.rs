use std::fmt;

use serde::{Deserialize, Serialize};

use super::request::{AnalysisRequest, Depth};

/// One independently generated slice of the analysis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Summary,
    Pricing,
    Categories,
    Predictions,
}

impl Facet {
    /// Every facet in collection order.
    pub const ALL: [Facet; 4] = [
        Facet::Summary,
        Facet::Pricing,
        Facet::Categories,
        Facet::Predictions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Facet::Summary => "summary",
            Facet::Pricing => "pricing",
            Facet::Categories => "categories",
            Facet::Predictions => "predictions",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Facet::Summary => "Market summary",
            Facet::Pricing => "Pricing trends",
            Facet::Categories => "Hot categories",
            Facet::Predictions => "Technology and strategy predictions",
        }
    }

    pub fn shape(self) -> ExpectedShape {
        match self {
            Facet::Summary => ExpectedShape::MarketSummary,
            Facet::Pricing => ExpectedShape::PricingTrends,
            Facet::Categories => ExpectedShape::HotCategories,
            Facet::Predictions => ExpectedShape::Predictions,
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON document a facet prompt asks the model to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    MarketSummary,
    PricingTrends,
    HotCategories,
    Predictions,
}

impl ExpectedShape {
    pub fn tag(self) -> &'static str {
        match self {
            ExpectedShape::MarketSummary => "market_summary",
            ExpectedShape::PricingTrends => "pricing_trends",
            ExpectedShape::HotCategories => "hot_categories",
            ExpectedShape::Predictions => "predictions",
        }
    }

    fn example(self) -> &'static str {
        match self {
            ExpectedShape::MarketSummary => {
                "{\n  \"overview\": \"2-3 sentence market overview\",\n  \
                 \"highlights\": [\"key insight\", \"key insight\"],\n  \
                 \"platform_outlook\": [\n    {\"platform\": \"PLATFORM NAME\", \
                 \"growth\": \"up|down|flat\", \"focus\": \"what sells best there\"}\n  ]\n}"
            }
            ExpectedShape::PricingTrends => {
                "{\n  \"pricing_trends\": [\n    {\"category\": \"CATEGORY NAME\", \
                 \"direction\": \"up|down|flat\", \"magnitude_percent\": 12.5}\n  ]\n}"
            }
            ExpectedShape::HotCategories => {
                "{\n  \"hot_categories\": [\n    {\"name\": \"CATEGORY NAME\", \
                 \"confidence\": 0.85}\n  ]\n}"
            }
            ExpectedShape::Predictions => {
                "{\n  \"technology_trends\": [\"trend\"],\n  \
                 \"strategy_suggestions\": [\"actionable strategy\"],\n  \
                 \"market_opportunities\": [\"underserved niche\"],\n  \
                 \"seller_success_factors\": [\"what top sellers do differently\"]\n}"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    pub facet: Facet,
    pub shape: ExpectedShape,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

const SYSTEM_PROMPT: &str = "You are a senior market intelligence analyst covering digital \
    product marketplaces (templates, courses, design assets, software tools). \
    Base every statement on observable market signals, quantify where possible, \
    and never invent platforms or categories that were not asked about unless the \
    prompt explicitly requests new ones. Respond with a single JSON document and \
    no prose outside it.";

struct Counts {
    categories: usize,
    highlights: usize,
    technology: usize,
    strategies: usize,
    opportunities: usize,
}

fn counts(depth: Depth) -> Counts {
    match depth {
        Depth::Summary => Counts {
            categories: 5,
            highlights: 3,
            technology: 4,
            strategies: 5,
            opportunities: 3,
        },
        Depth::Detailed => Counts {
            categories: 10,
            highlights: 6,
            technology: 8,
            strategies: 10,
            opportunities: 6,
        },
    }
}

fn max_tokens(facet: Facet, depth: Depth) -> u32 {
    let base = match facet {
        Facet::Summary => 1024,
        Facet::Pricing | Facet::Categories => 1536,
        Facet::Predictions => 2048,
    };
    match depth {
        Depth::Summary => base,
        Depth::Detailed => base * 2,
    }
}

/// Builds the prompt for a single facet.
pub fn build_prompt(request: &AnalysisRequest, facet: Facet) -> PromptSpec {
    let counts = counts(request.depth);
    let platforms = request
        .platforms
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let categories = request
        .categories
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");
    let horizon = request.horizon_months;

    let task = match facet {
        Facet::Summary => format!(
            "Summarize the current state of the digital product market across these \
             platforms and where it is heading over the next {horizon} months. \
             Give an overview and at most {} highlights covering market health, \
             the top trend, the biggest opportunity and the pricing sweet spot. \
             Add a growth outlook and main product focus for each platform listed.",
            counts.highlights
        ),
        Facet::Pricing => format!(
            "For each category below, predict the direction of typical selling prices \
             over the next {horizon} months and the expected size of the change in \
             percent, as a non-negative number. Use only the category names exactly \
             as listed."
        ),
        Facet::Categories => format!(
            "Rank up to {} digital product categories expected to be in highest \
             demand over the next {horizon} months. You may include emerging \
             categories beyond the list below. Give each a confidence between 0 and 1.",
            counts.categories
        ),
        Facet::Predictions => format!(
            "Predict up to {} technology trends that will shape digital products over \
             the next {horizon} months and give up to {} concrete strategy suggestions \
             for sellers on these platforms. Also list up to {} market opportunities \
             and up to {} traits shared by the most successful sellers.",
            counts.technology, counts.strategies, counts.opportunities, counts.opportunities
        ),
    };

    let prompt = format!(
        "{task}\n\n\
         Platforms: {platforms}\n\
         Categories:\n{categories}\n\
         Forecast horizon: {horizon} months\n\
         Depth: {depth}\n\n\
         Return your answer as JSON with this exact structure:\n{example}",
        depth = request.depth.label(),
        example = facet.shape().example(),
    );

    PromptSpec {
        facet,
        shape: facet.shape(),
        system: SYSTEM_PROMPT.to_string(),
        prompt,
        max_tokens: max_tokens(facet, request.depth),
    }
}

/// One prompt per facet, in [`Facet::ALL`] order.
pub fn build_prompts(request: &AnalysisRequest) -> Vec<PromptSpec> {
    Facet::ALL
        .iter()
        .map(|&facet| build_prompt(request, facet))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_prompt_per_facet_in_order() {
        let prompts = build_prompts(&AnalysisRequest::default());
        let facets: Vec<Facet> = prompts.iter().map(|p| p.facet).collect();
        assert_eq!(facets, Facet::ALL.to_vec());
    }

    #[test]
    fn test_prompt_embeds_request_fields() {
        let request = AnalysisRequest::new(
            ["Etsy", "Gumroad"],
            ["Notion Templates"],
            Depth::Summary,
            9,
        );
        let spec = build_prompt(&request, Facet::Pricing);
        assert!(spec.prompt.contains("Etsy, Gumroad"));
        assert!(spec.prompt.contains("- Notion Templates"));
        assert!(spec.prompt.contains("9 months"));
        assert!(spec.prompt.contains("\"magnitude_percent\""));
        assert_eq!(spec.shape, ExpectedShape::PricingTrends);
    }

    #[test]
    fn test_depth_changes_item_counts_and_budget() {
        let mut request = AnalysisRequest::default();
        request.depth = Depth::Summary;
        let short = build_prompt(&request, Facet::Categories);
        request.depth = Depth::Detailed;
        let long = build_prompt(&request, Facet::Categories);

        assert!(short.prompt.contains("up to 5"));
        assert!(long.prompt.contains("up to 10"));
        assert!(long.max_tokens > short.max_tokens);
    }

    #[test]
    fn test_predictions_prompt_asks_for_seller_patterns() {
        let mut request = AnalysisRequest::default();
        request.depth = Depth::Detailed;
        let spec = build_prompt(&request, Facet::Predictions);
        assert!(spec.prompt.contains("\"market_opportunities\""));
        assert!(spec.prompt.contains("\"seller_success_factors\""));
        assert!(spec.prompt.contains("up to 6 market opportunities"));

        let summary = build_prompt(&request, Facet::Summary);
        assert!(summary.prompt.contains("\"platform_outlook\""));
    }

    #[test]
    fn test_prompts_are_pure() {
        let request = AnalysisRequest::default();
        assert_eq!(build_prompts(&request), build_prompts(&request));
    }

    #[test]
    fn test_facet_display_and_serde_agree() {
        for facet in Facet::ALL {
            let json = serde_json::to_value(facet).unwrap();
            assert_eq!(json, facet.as_str());
            assert_eq!(facet.to_string(), facet.as_str());
        }
    }
}
