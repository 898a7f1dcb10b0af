//! Story prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::prd::{Prd, Story};

const STORY_TEMPLATE: &str = include_str!("prompts/story.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("story", STORY_TEMPLATE)
            .context("load story template")?;
        Ok(Self { env })
    }

    fn render_story(&self, prd: &Prd, story: &Story, index: usize) -> Result<String> {
        let template = self.env.get_template("story")?;
        let rendered = template.render(context! {
            title => prd.title.trim(),
            principles => prd.principles.as_deref().filter(|items| !items.is_empty()),
            position => index + 1,
            total => prd.stories.len(),
            story => story,
        })?;
        Ok(rendered)
    }
}

/// Render the prompt for the story at `index` of `prd`.
pub fn render_story_prompt(prd: &Prd, story: &Story, index: usize) -> Result<String> {
    let engine = PromptEngine::new()?;
    let mut prompt = engine
        .render_story(prd, story, index)
        .with_context(|| format!("render prompt for story {}", story.id))?;
    if !prompt.ends_with('\n') {
        prompt.push('\n');
    }
    debug!(story_id = %story.id, bytes = prompt.len(), "rendered story prompt");
    Ok(prompt)
}
