//! Dietary profile categories and the human-readable profile summary.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// The four fixed preference categories a user can fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceCategory {
    Allergies,
    DietaryTypes,
    HealthConditions,
    FoodPreferences,
}

impl PreferenceCategory {
    /// All categories in display order.
    pub const ALL: [PreferenceCategory; 4] = [
        Self::Allergies,
        Self::DietaryTypes,
        Self::HealthConditions,
        Self::FoodPreferences,
    ];

    /// Storage key for this category's index set.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Allergies => "allergies",
            Self::DietaryTypes => "dietary_types",
            Self::HealthConditions => "health_conditions",
            Self::FoodPreferences => "food_preferences",
        }
    }

    /// Heading used in the profile summary.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Allergies => "Allergies",
            Self::DietaryTypes => "Dietary type",
            Self::HealthConditions => "Health conditions",
            Self::FoodPreferences => "Food preferences",
        }
    }

    /// Selectable options; stored selections are indices into this list.
    pub fn options(&self) -> &'static [&'static str] {
        match self {
            Self::Allergies => &[
                "Peanuts",
                "Tree nuts",
                "Milk",
                "Eggs",
                "Wheat",
                "Soy",
                "Fish",
                "Shellfish",
                "Sesame",
                "Gluten",
                "Mustard",
                "Sulfites",
            ],
            Self::DietaryTypes => &[
                "Vegetarian",
                "Vegan",
                "Pescatarian",
                "Keto",
                "Paleo",
                "Halal",
                "Kosher",
                "Low FODMAP",
            ],
            Self::HealthConditions => &[
                "Diabetes",
                "Hypertension",
                "High cholesterol",
                "Celiac disease",
                "Lactose intolerance",
                "Kidney disease",
                "Gout",
                "Pregnancy",
            ],
            Self::FoodPreferences => &[
                "Low sugar",
                "Low sodium",
                "Low fat",
                "High protein",
                "No artificial sweeteners",
                "No artificial colors",
                "No preservatives",
                "Organic",
            ],
        }
    }

    /// Parse a category from its storage key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.key() == key)
    }
}

/// A user's selections across all categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProfile {
    selections: BTreeMap<PreferenceCategory, BTreeSet<usize>>,
}

impl HealthProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the selected indices for a category.
    pub fn with(mut self, category: PreferenceCategory, indices: impl IntoIterator<Item = usize>) -> Self {
        self.set(category, indices.into_iter().collect());
        self
    }

    pub fn set(&mut self, category: PreferenceCategory, indices: BTreeSet<usize>) {
        if indices.is_empty() {
            self.selections.remove(&category);
        } else {
            self.selections.insert(category, indices);
        }
    }

    /// Selected indices for a category (empty if none).
    pub fn indices(&self, category: PreferenceCategory) -> BTreeSet<usize> {
        self.selections.get(&category).cloned().unwrap_or_default()
    }

    /// Selected option labels for a category. Out-of-range indices are skipped.
    pub fn labels(&self, category: PreferenceCategory) -> Vec<&'static str> {
        let options = category.options();
        self.selections
            .get(&category)
            .into_iter()
            .flatten()
            .filter_map(|&i| {
                let label = options.get(i).copied();
                if label.is_none() {
                    debug!(category = category.key(), index = i, "ignoring stale preference index");
                }
                label
            })
            .collect()
    }

    /// Newline-joined human-readable summary, one line per non-empty category.
    pub fn summary(&self) -> String {
        let lines: Vec<String> = PreferenceCategory::ALL
            .iter()
            .filter_map(|category| {
                let labels = self.labels(*category);
                (!labels.is_empty()).then(|| format!("{}: {}", category.title(), labels.join(", ")))
            })
            .collect();

        if lines.is_empty() {
            "No specific dietary restrictions".to_string()
        } else {
            lines.join("\n")
        }
    }
}
