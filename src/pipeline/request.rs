use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const MAX_HORIZON_MONTHS: u32 = 36;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Summary,
    #[default]
    Detailed,
}

impl Depth {
    pub fn label(self) -> &'static str {
        match self {
            Depth::Summary => "Summary",
            Depth::Detailed => "Detailed",
        }
    }
}

/// What to analyze. Built by the caller once per run and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub platforms: BTreeSet<String>,
    pub categories: Vec<String>,
    #[serde(default)]
    pub depth: Depth,
    pub horizon_months: u32,
}

impl AnalysisRequest {
    pub fn new<P, C>(platforms: P, categories: C, depth: Depth, horizon_months: u32) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            platforms: platforms.into_iter().map(Into::into).collect(),
            categories: categories.into_iter().map(Into::into).collect(),
            depth,
            horizon_months,
        }
    }

    /// Rejects requests the pipeline should never be asked to run.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.horizon_months == 0 {
            return Err(AppError::Validation(
                "horizon_months must be greater than zero".into(),
            ));
        }
        if self.horizon_months > MAX_HORIZON_MONTHS {
            return Err(AppError::Validation(format!(
                "horizon_months must be at most {MAX_HORIZON_MONTHS}"
            )));
        }
        if self.categories.is_empty() {
            return Err(AppError::Validation("categories must not be empty".into()));
        }
        if self.platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(AppError::Validation(
                "platform names must not be blank".into(),
            ));
        }

        let mut seen = HashSet::new();
        for category in &self.categories {
            let key = category.trim().to_lowercase();
            if key.is_empty() {
                return Err(AppError::Validation(
                    "category names must not be blank".into(),
                ));
            }
            if !seen.insert(key) {
                return Err(AppError::Validation(format!(
                    "duplicate category {category:?}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for AnalysisRequest {
    fn default() -> Self {
        Self::new(
            [
                "Etsy",
                "Shopify",
                "Gumroad",
                "Creative Market",
                "Envato",
                "Udemy",
                "Patreon",
            ],
            [
                "AI-Enhanced Design Templates",
                "Sustainable Digital Assets",
                "Interactive Digital Products",
                "Personal Productivity Tools",
                "Educational Content Packages",
            ],
            Depth::Detailed,
            6,
        )
    }
}
