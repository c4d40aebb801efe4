//! Experiment configuration file support

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use annot_agent::ExperimentConfig;

/// Load and validate an experiment configuration
pub fn load(path: &Path) -> anyhow::Result<ExperimentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    ExperimentConfig::from_toml(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# annot experiment configuration

# Upper bound of requests per second against the endpoint. The queue starts
# here and backs off on failures.
max_requests_per_second = 10

# Repeat the conversation for each publication to estimate model randomness
num_trials_per_publication = 1

[endpoint]
# api_key = "sk-or-..."   # prefer the OPENROUTER_API_KEY environment variable
api_url = "https://openrouter.ai/api/v1/"
timeout_secs = 30
# Don't make HTTP calls. Every conversation fails without spending credits.
dry_run = false

[conversation]
model = "google/gemini-2.5-flash"
# providers = ["Google"]   # use exactly these providers, in order

[[conversation.turns]]
name = "annotate"

[[conversation.turns.request_handlers]]
type = "AddUserMessage"
message = """
Annotate the following publication. Answer with one JSON object in a
```json code block, for example {{"organism": "..."}}.

{publication}
"""

[[conversation.turns.response_handlers]]
type = "FencedJsonBlock"
key_for_context_storage = "annotation"
fail_on_parsing_error = true

[conversation.turns.response_handlers.json_schema]
name = "annotation"

[conversation.turns.response_handlers.json_schema.schema]
type = "object"
required = ["organism"]

[conversation.turns.response_handlers.json_schema.schema.properties.organism]
type = "string"
"#
}
