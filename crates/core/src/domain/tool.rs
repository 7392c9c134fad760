use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of capabilities a turn may invoke. Adding a tool means adding
/// a variant here and registering an adapter for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    DataAccess,
    AnalyticsData,
    FlashSaleManager,
    VectorSearch,
    ImageGenerator,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::DataAccess,
        ToolName::AnalyticsData,
        ToolName::FlashSaleManager,
        ToolName::VectorSearch,
        ToolName::ImageGenerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataAccess => "data_access",
            Self::AnalyticsData => "analytics_data",
            Self::FlashSaleManager => "flash_sale_manager",
            Self::VectorSearch => "vector_search",
            Self::ImageGenerator => "image_generator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "data_access" => Some(Self::DataAccess),
            "analytics_data" => Some(Self::AnalyticsData),
            "flash_sale_manager" => Some(Self::FlashSaleManager),
            "vector_search" => Some(Self::VectorSearch),
            "image_generator" => Some(Self::ImageGenerator),
            _ => None,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
