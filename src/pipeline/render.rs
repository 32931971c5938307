use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::analysis::{AnalysisResult, PricingTrend, TrendDirection};
use super::prompts::Facet;

pub const EXECUTIVE_SUMMARY: &str = "Executive Summary";
pub const HOT_CATEGORIES: &str = "Hot Categories";
pub const PRICING_TRENDS: &str = "Pricing Trends";
pub const TECHNOLOGY_TRENDS: &str = "Technology Trends";
pub const STRATEGY_SUGGESTIONS: &str = "Strategy Suggestions";
pub const METHODOLOGY: &str = "Methodology & Disclaimer";

const PLATFORM_OUTLOOK: &str = "Platform Outlook";
const MARKET_OPPORTUNITIES: &str = "Market Opportunities";
const SELLER_SUCCESS_FACTORS: &str = "Seller Success Factors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub html_body: String,
    pub subject: String,
    /// Section titles in the order they appear in `html_body`.
    pub sections: Vec<String>,
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn subject_for(analysis: &AnalysisResult) -> String {
    format!(
        "Digital Market Intelligence ({}) - {}",
        analysis.depth.label(),
        analysis.generated_at.format("%B %d, %Y")
    )
}

const STYLE: &str = "body{font-family:Arial,Helvetica,sans-serif;color:#222;max-width:760px;\
margin:0 auto;padding:24px;line-height:1.5}\
h1{color:#1f3a5f;border-bottom:3px solid #1f3a5f;padding-bottom:8px}\
h2{color:#1f3a5f;margin-top:32px}\
h3{color:#344054;margin-top:20px}\
table{border-collapse:collapse;width:100%}\
th,td{border:1px solid #ddd;padding:8px;text-align:left}\
th{background:#f2f5f9}\
.up{color:#1a7f37}.down{color:#b42318}.flat{color:#667085}\
.note{background:#f8f9fb;border-left:4px solid #98a2b3;padding:12px}";

fn open_section(html: &mut String, sections: &mut Vec<String>, title: &str) {
    sections.push(title.to_string());
    let _ = write!(html, "<section><h2>{}</h2>", escape_html(title));
}

fn list(html: &mut String, items: &[String], ordered: bool) {
    let tag = if ordered { "ol" } else { "ul" };
    let _ = write!(html, "<{tag}>");
    for item in items {
        let _ = write!(html, "<li>{}</li>", escape_html(item));
    }
    let _ = write!(html, "</{tag}>");
}

fn subsection(html: &mut String, title: &str) {
    let _ = write!(html, "<h3>{}</h3>", escape_html(title));
}

/// Percent change with the sign taken from the direction.
fn change(trend: &PricingTrend) -> String {
    match trend.direction {
        TrendDirection::Flat => format!("{:.1}%", trend.magnitude_percent),
        TrendDirection::Up | TrendDirection::Down => format!("{:+.1}%", trend.signed_percent()),
    }
}

fn direction_marker(direction: TrendDirection) -> &'static str {
    match direction {
        TrendDirection::Up => "&#9650; up",
        TrendDirection::Down => "&#9660; down",
        TrendDirection::Flat => "&#9644; flat",
    }
}

/// Renders an analysis into an HTML email. Pure: equal inputs give
/// byte-identical output.
#[tracing::instrument(
    name = "pipeline_stage render",
    skip(analysis),
    fields(
        pipeline.stage = "render",
        report.sections_count,
        report.html_bytes,
    )
)]
pub fn render(analysis: &AnalysisResult) -> Report {
    let subject = subject_for(analysis);
    let mut sections = Vec::new();
    let mut html = String::with_capacity(8 * 1024);

    let _ = write!(
        html,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>{STYLE}</style></head><body><h1>{title}</h1>\
         <p>Generated {generated} &middot; {depth} analysis &middot; {horizon}-month outlook</p>",
        title = escape_html(&subject),
        generated = analysis.generated_at.format("%Y-%m-%d %H:%M UTC"),
        depth = analysis.depth.label(),
        horizon = analysis.horizon_months,
    );

    if let Some(summary) = &analysis.executive_summary {
        open_section(&mut html, &mut sections, EXECUTIVE_SUMMARY);
        let _ = write!(html, "<p>{}</p>", escape_html(&summary.overview));
        if !summary.highlights.is_empty() {
            list(&mut html, &summary.highlights, false);
        }
        if !summary.platform_outlook.is_empty() {
            subsection(&mut html, PLATFORM_OUTLOOK);
            html.push_str("<table><tr><th>Platform</th><th>Growth</th><th>Focus</th></tr>");
            for outlook in &summary.platform_outlook {
                let _ = write!(
                    html,
                    "<tr><td>{}</td><td class=\"{}\">{}</td><td>{}</td></tr>",
                    escape_html(&outlook.platform),
                    outlook.growth,
                    direction_marker(outlook.growth),
                    escape_html(outlook.focus.as_deref().unwrap_or("")),
                );
            }
            html.push_str("</table>");
        }
        html.push_str("</section>");
    }

    if !analysis.hot_categories.is_empty() {
        open_section(&mut html, &mut sections, HOT_CATEGORIES);
        html.push_str("<table><tr><th>#</th><th>Category</th><th>Confidence</th></tr>");
        for (rank, category) in analysis.hot_categories.iter().enumerate() {
            let _ = write!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{:.0}%</td></tr>",
                rank + 1,
                escape_html(&category.name),
                category.confidence * 100.0
            );
        }
        html.push_str("</table></section>");
    }

    if !analysis.pricing_trends.is_empty() {
        open_section(&mut html, &mut sections, PRICING_TRENDS);
        html.push_str("<table><tr><th>Category</th><th>Direction</th><th>Change</th></tr>");
        for (category, trend) in &analysis.pricing_trends {
            let _ = write!(
                html,
                "<tr><td>{}</td><td class=\"{}\">{}</td><td>{}</td></tr>",
                escape_html(category),
                trend.direction,
                direction_marker(trend.direction),
                change(trend)
            );
        }
        html.push_str("</table></section>");
    }

    if !analysis.technology_trends.is_empty() {
        open_section(&mut html, &mut sections, TECHNOLOGY_TRENDS);
        list(&mut html, &analysis.technology_trends, false);
        html.push_str("</section>");
    }

    if !analysis.strategy_suggestions.is_empty()
        || !analysis.market_opportunities.is_empty()
        || !analysis.seller_success_factors.is_empty()
    {
        open_section(&mut html, &mut sections, STRATEGY_SUGGESTIONS);
        if !analysis.strategy_suggestions.is_empty() {
            list(&mut html, &analysis.strategy_suggestions, true);
        }
        if !analysis.market_opportunities.is_empty() {
            subsection(&mut html, MARKET_OPPORTUNITIES);
            list(&mut html, &analysis.market_opportunities, false);
        }
        if !analysis.seller_success_factors.is_empty() {
            subsection(&mut html, SELLER_SUCCESS_FACTORS);
            list(&mut html, &analysis.seller_success_factors, false);
        }
        html.push_str("</section>");
    }

    open_section(&mut html, &mut sections, METHODOLOGY);
    methodology(&mut html, analysis);
    html.push_str("</section></body></html>");

    let span = tracing::Span::current();
    span.record("report.sections_count", sections.len());
    span.record("report.html_bytes", html.len());

    Report {
        html_body: html,
        subject,
        sections,
    }
}

fn methodology(html: &mut String, analysis: &AnalysisResult) {
    let covered: Vec<&str> = analysis.coverage.iter().map(|f| f.label()).collect();
    let _ = write!(
        html,
        "<p>This report was produced by a generative language model prompted with the \
         requested platforms and categories. Coverage: {} of {} analysis facets ({}).</p>",
        analysis.coverage.len(),
        Facet::ALL.len(),
        escape_html(&covered.join(", "))
    );

    if !analysis.is_complete() {
        let missing: Vec<&str> = Facet::ALL
            .iter()
            .filter(|f| !analysis.coverage.contains(f))
            .map(|f| f.label())
            .collect();
        let _ = write!(
            html,
            "<p class=\"note\"><strong>Partial analysis.</strong> The following facets \
             could not be generated for this run and are not included: {}.</p>",
            escape_html(&missing.join(", "))
        );
    }

    html.push_str(
        "<ul>\
         <li><strong>AI-Generated Insights:</strong> figures and rankings are model \
         estimates, not measured marketplace data.</li>\
         <li><strong>Market Volatility:</strong> digital product demand can shift quickly; \
         validate before committing inventory or spend.</li>\
         <li><strong>Platform Variations:</strong> pricing and demand differ between \
         marketplaces and regions.</li>\
         <li><strong>External Factors:</strong> platform policy changes, seasonality and \
         economic conditions are not modeled.</li>\
         </ul>",
    );
}
