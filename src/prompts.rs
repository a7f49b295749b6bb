use handlebars::Handlebars;
use serde::Serialize;

pub(crate) const JUDGE_SYSTEM: &str = "You are an expert conversation analyst. You grade simulated \
conversations strictly against the criteria you are given and answer only with the requested JSON.";

pub(crate) const JUDGE_TEMPLATE: &str = r#"Here is a conversation between {{kind}}:

{{transcript}}

Evaluation criteria (rubric {{rubric_id}} v{{rubric_version}}):
{{criteria}}

Give a boolean verdict (true for pass, false for fail) and brief feedback explaining the decision for each of these participants:
{{#each roles}}
- `{{this.key}}`: the {{this.display}}
{{/each}}
The overall evaluation passes only if every participant passes."#;

pub(crate) const OPTIMIZER_SYSTEM: &str =
    "You are an AI expert at improving system prompts based on test results.";

pub(crate) const OPTIMIZER_TEMPLATE: &str = r#"You are optimizing the system prompt of the {{role_display}} in simulated conversations between {{kind}}.

CURRENT PROMPT:
{{current_prompt}}

EVALUATION CRITERIA (rubric {{rubric_id}} v{{rubric_version}}):
{{criteria}}

RESULTS: {{passed}}/{{total}} simulations passed ({{pass_rate}}).
{{#each records}}

--- Simulation {{this.simulation_id}} (start index {{this.start_index}}): {{#if this.passed}}PASSED{{else}}FAILED{{/if}} ---
{{this.transcript}}

Judge feedback:
{{#each this.feedback}}
- {{this.label}}: {{#if this.passed}}pass{{else}}fail{{/if}}. {{this.text}}
{{/each}}
{{/each}}

Analyse what made conversations fail and return an improved system prompt for the {{role_display}} that keeps its original purpose while addressing the feedback. Also explain what you changed and why."#;

pub(crate) const RUBRIC_REFINER_SYSTEM: &str = "You are an expert prompt engineer who tunes \
evaluation criteria so that an automated grader agrees with human reviewers.";

pub(crate) const RUBRIC_REFINER_TEMPLATE: &str = r#"You are improving the evaluation criteria a grader uses for conversations between {{kind}}.

CURRENT CRITERIA (rubric {{rubric_id}} v{{rubric_version}}):
{{criteria}}

The grader agreed with human reviewers on {{accurate}}/{{total}} labeled conversations ({{accuracy}}). It disagreed on these:
{{#each examples}}

--- Example {{this.number}} ---
{{this.transcript}}

Verdicts:
{{#each this.roles}}
- {{this.label}}: human {{#if this.expected}}PASS{{else}}FAIL{{/if}}, grader {{this.actual}}.{{#if this.human_feedback}} Human feedback: {{this.human_feedback}}{{/if}}
{{/each}}
{{#if this.error}}Grader error: {{this.error}}
{{/if}}
{{/each}}

Return improved criteria that keep the same purpose and structure but would lead the grader to the human verdicts above. Put the complete criteria text in `improved_prompt` and explain what you changed in `analysis`."#;

/// Renders a template without HTML escaping; prompts are plain text.
pub(crate) fn render<T: Serialize>(template: &str, data: &T) -> Result<String, handlebars::RenderError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.render_template(template, data)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::render;

    #[test]
    fn does_not_html_escape() {
        let out = render("{{text}}", &json!({"text": "fees < 3.5% & \"fine print\""})).unwrap();
        assert_eq!(out, "fees < 3.5% & \"fine print\"");
    }
}
