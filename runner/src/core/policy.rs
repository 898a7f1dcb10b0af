//! Conservative task-list policy not expressible via JSON Schema.

use std::collections::HashSet;

use crate::prd::Prd;

/// Maximum number of stories a single run accepts.
pub const MAX_STORIES: usize = 10;

/// Check the business-policy gates a task list must pass before execution:
/// - At most [`MAX_STORIES`] stories
/// - No duplicate story ids
/// - No `L`/`XL` stories
///
/// Returns stable error messages (empty on success).
pub fn validate_policy(prd: &Prd) -> Vec<String> {
    let mut errors = Vec::new();

    if prd.stories.len() > MAX_STORIES {
        errors.push(format!(
            "too many stories (max {MAX_STORIES}, got {})",
            prd.stories.len()
        ));
    }

    let mut seen = HashSet::new();
    let mut dupes = Vec::new();
    for story in &prd.stories {
        if !seen.insert(story.id.as_str()) && !dupes.contains(&story.id.as_str()) {
            dupes.push(story.id.as_str());
        }
    }
    if !dupes.is_empty() {
        errors.push(format!("duplicate story ids: {}", dupes.join(", ")));
    }

    let too_big: Vec<String> = prd
        .stories
        .iter()
        .filter(|story| story.size.is_large())
        .map(|story| format!("{}:{}", story.id, story.size.as_str()))
        .collect();
    if !too_big.is_empty() {
        errors.push(format!(
            "only S/M stories are allowed, too large: {}",
            too_big.join(", ")
        ));
    }

    errors
}
