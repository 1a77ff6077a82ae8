//! Prompt scaffolding for both strategies.
//!
//! The wording is intentionally thin; what matters to the pipeline is the
//! stage order and that the last stage (and the single-pass prompt) asks for
//! the story collection JSON that [`crate::story::parse_story_collection`]
//! understands.

/// The nine dependent stages of the alternate strategy, in execution order.
pub const ALTERNATE_STAGES: [&str; 9] = [
    "content_analyst",
    "creative_writer",
    "financial_expert",
    "comedy_expert",
    "family_strategist",
    "ai_specialist",
    "platform_optimizer",
    "database_architect",
    "quality_assurance",
];

const OUTPUT_CONTRACT: &str = "Respond with JSON only: an object whose \
\"investing-dojo-stories\" key holds a list of stories. Every story needs \
\"id\", \"title\", \"summary\", \"full_content\" and \"content_type\"; add \
\"actionable_practices\", \"discussion_prompts\", \"belt_levels\", \
\"family_security_relevance\" and \"children_education_angle\" when they apply.";

fn stage_task(name: &str) -> &'static str {
    match name {
        "content_analyst" => "Extract the key investing insights, quotes and moments from the transcript.",
        "creative_writer" => "Turn the analysis into draft stories with a clear narrative arc.",
        "financial_expert" => "Check every financial claim and add accurate, actionable practices.",
        "comedy_expert" => "Add light humour where it helps the lesson land, without undermining it.",
        "family_strategist" => "Add family security relevance and angles for teaching children.",
        "ai_specialist" => "Note AI tools or techniques mentioned and how investors can use them.",
        "platform_optimizer" => "Assign belt levels and discussion prompts for the learning platform.",
        "database_architect" => "Normalise the stories into the final field structure.",
        "quality_assurance" => "Review everything and emit the final story collection.",
        _ => "Improve the stories.",
    }
}

/// System prompt for stage `index` (0-based) of the alternate strategy.
pub fn stage_prompt(index: usize) -> String {
    let name = ALTERNATE_STAGES.get(index).copied().unwrap_or("unknown");
    let mut prompt = format!(
        "## Stage {}/{}: {name}\n\n{}",
        index + 1,
        ALTERNATE_STAGES.len(),
        stage_task(name)
    );
    if index + 1 == ALTERNATE_STAGES.len() {
        prompt.push_str("\n\n");
        prompt.push_str(OUTPUT_CONTRACT);
    }
    prompt
}

/// System prompt for the primary strategy.
pub fn primary_prompt() -> String {
    format!(
        "## Single-pass story generation\n\nRead the podcast transcript and write \
         educational investing stories from it.\n\n{OUTPUT_CONTRACT}"
    )
}

/// User content for the first call of either strategy.
pub fn transcript_context(episode_title: &str, transcript: &str) -> String {
    format!("Episode: {episode_title}\n\nTranscript:\n{transcript}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_last_stage_carries_output_contract() {
        for i in 0..ALTERNATE_STAGES.len() - 1 {
            assert!(!stage_prompt(i).contains("investing-dojo-stories"));
        }
        let last = stage_prompt(8);
        assert!(last.starts_with("## Stage 9/9: quality_assurance"));
        assert!(last.contains("investing-dojo-stories"));
    }

    #[test]
    fn primary_prompt_asks_for_collection() {
        let p = primary_prompt();
        assert!(p.starts_with("## Single-pass story generation"));
        assert!(p.contains("full_content"));
    }
}
