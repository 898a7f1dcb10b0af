//! Task list ("PRD") data model.
//!
//! A task list is an ordered sequence of stories. Story ids are the only key
//! used for progress tracking; their order is the execution order.

use serde::{Deserialize, Serialize};

/// Schema version accepted by this runner.
pub const PRD_SCHEMA_VERSION: &str = "0.1";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prd {
    pub schema_version: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<PrdRepo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principles: Option<Vec<String>>,
    pub stories: Vec<Story>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrdRepo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub size: StorySize,
    pub acceptance: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
}

/// T-shirt size of a story.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StorySize {
    S,
    M,
    L,
    #[serde(rename = "XL")]
    Xl,
}

impl StorySize {
    pub fn as_str(self) -> &'static str {
        match self {
            StorySize::S => "S",
            StorySize::M => "M",
            StorySize::L => "L",
            StorySize::Xl => "XL",
        }
    }

    /// `L` and `XL` stories are too large to hand to a single agent call.
    pub fn is_large(self) -> bool {
        matches!(self, StorySize::L | StorySize::Xl)
    }
}

impl Prd {
    pub fn position_of(&self, story_id: &str) -> Option<usize> {
        self.stories.iter().position(|story| story.id == story_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_prd() {
        let raw = r#"{
            "schema_version": "0.1",
            "title": "Demo",
            "stories": [
                {"id": "S1", "title": "First", "size": "XL", "acceptance": ["works"]}
            ]
        }"#;
        let prd: Prd = serde_json::from_str(raw).expect("parse");
        assert_eq!(prd.stories[0].size, StorySize::Xl);
        assert!(prd.stories[0].size.is_large());
        assert_eq!(prd.stories[0].constraints, None);
        assert_eq!(prd.position_of("S1"), Some(0));
        assert_eq!(prd.position_of("S9"), None);
    }

    #[test]
    fn size_labels_match_serialized_form() {
        for size in [StorySize::S, StorySize::M, StorySize::L, StorySize::Xl] {
            let json = serde_json::to_string(&size).expect("serialize");
            assert_eq!(json, format!("\"{}\"", size.as_str()));
        }
    }
}
