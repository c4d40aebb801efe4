//! Many conversations against one shared queue

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use annot_ai::{Message, OpenRouterClient, Transport};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::conversation::{Conversation, ConversationConfig, LlmClient, LlmQueue};
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::queue::{QueueConfig, RateLimitedQueue};

pub const CONVERSATIONS_FILENAME: &str = "conversations.json";
pub const CONTEXT_FILENAME: &str = "data.json";
pub const SUMMARY_FILENAME: &str = "summary.json";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const PAYLOADS_FOLDER: &str = "payloads";

/// Connection settings of the model endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Falls back to the `OPENROUTER_API_KEY` environment variable
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_url: String,
    pub timeout_secs: u64,
    /// Fail every call without touching the network
    pub dry_run: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: annot_ai::providers::openrouter::DEFAULT_API_URL.to_string(),
            timeout_secs: annot_ai::providers::openrouter::DEFAULT_TIMEOUT.as_secs(),
            dry_run: false,
        }
    }
}

impl EndpointConfig {
    /// Build the client. A dry run works without an API key.
    pub fn client(&self) -> Result<OpenRouterClient> {
        let api_key = match annot_ai::providers::get_api_key(
            self.api_key.as_deref(),
            annot_ai::providers::openrouter::API_KEY_ENV_VAR,
        ) {
            Ok(key) => key,
            Err(_) if self.dry_run => "dry-run".to_string(),
            Err(error) => return Err(error.into()),
        };
        Ok(OpenRouterClient::new(api_key)
            .with_api_url(self.api_url.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_dry_run(self.dry_run))
    }
}

fn default_max_requests_per_second() -> f64 {
    10.0
}

fn default_num_trials() -> usize {
    1
}

/// Everything an experiment run needs besides its data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Upper rate bound of the shared queue; it also starts there
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: f64,
    /// Repeat each conversation to estimate model randomness
    #[serde(default = "default_num_trials")]
    pub num_trials_per_publication: usize,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    pub conversation: ConversationConfig,
}

impl ExperimentConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_requests_per_second > 0.0 && self.max_requests_per_second <= 100.0) {
            return Err(Error::InvalidConfig(format!(
                "max_requests_per_second must be within (0, 100], got {}",
                self.max_requests_per_second
            )));
        }
        if self.num_trials_per_publication == 0 {
            return Err(Error::InvalidConfig(
                "num_trials_per_publication must be at least 1".to_string(),
            ));
        }
        if self.conversation.model.is_empty() {
            return Err(Error::InvalidConfig("conversation.model is required".to_string()));
        }
        self.queue_config().validate()
    }

    /// Rate parameters of the queue in front of the model endpoint
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            name: "llm".to_string(),
            min_rps: 1.0_f64.min(self.max_requests_per_second),
            max_rps: self.max_requests_per_second,
            initial_rps: self.max_requests_per_second,
            max_retries: 2,
            ..QueueConfig::default()
        }
    }

    /// The shared queue; only transient failures are retried
    pub fn build_queue(&self) -> Result<LlmQueue> {
        Ok(RateLimitedQueue::new(self.queue_config())?
            .with_retry_filter(annot_ai::Error::is_retryable))
    }
}

/// One input document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub uuid: String,
    pub text: String,
}

/// Outcome counts of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub conversations: usize,
    pub failed: usize,
}

/// One conversation per publication and trial
pub struct Experiment {
    config: ExperimentConfig,
    conversations: BTreeMap<String, Vec<Conversation>>,
    summary: Option<ExperimentSummary>,
}

impl Experiment {
    /// Set up all conversations. They share `transport` behind one queue
    /// built from `config`.
    pub fn new(
        config: ExperimentConfig,
        publications: &[Publication],
        schema: Option<&Value>,
        registry: &HandlerRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let llm = LlmClient::new(transport, Arc::new(config.build_queue()?));

        tracing::debug!("Setting up conversations");
        let mut conversations = BTreeMap::new();
        for publication in publications {
            let trials = (0..config.num_trials_per_publication)
                .map(|trial| {
                    Conversation::new(
                        publication.uuid.clone(),
                        trial,
                        Context::for_publication(publication.text.clone(), schema.cloned()),
                        &config.conversation,
                        registry,
                        llm.clone(),
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            conversations.insert(publication.uuid.clone(), trials);
        }

        Ok(Self {
            config,
            conversations,
            summary: None,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values().flatten()
    }

    /// Run every conversation concurrently
    pub async fn run(&mut self) -> ExperimentSummary {
        tracing::info!("Starting experiment");
        let started_at = Utc::now();

        let results = join_all(
            self.conversations
                .values_mut()
                .flat_map(|trials| trials.iter_mut())
                .map(|conversation| conversation.converse()),
        )
        .await;

        let failed = results.iter().filter(|ok| !**ok).count();
        tracing::info!("{} of {} conversations failed.", failed, results.len());

        let summary = ExperimentSummary {
            started_at,
            finished_at: Utc::now(),
            conversations: results.len(),
            failed,
        };
        self.summary = Some(summary.clone());
        summary
    }

    /// Write histories, contexts, audit logs and the configuration used
    pub fn save(&self, folder: &Path) -> Result<()> {
        std::fs::create_dir_all(folder)?;

        let mut conversations: BTreeMap<&str, Vec<Vec<Message>>> = BTreeMap::new();
        let mut contexts: BTreeMap<&str, Vec<Context>> = BTreeMap::new();
        let payloads = folder.join(PAYLOADS_FOLDER);
        std::fs::create_dir_all(&payloads)?;

        for (uuid, trials) in &self.conversations {
            for conversation in trials {
                let record = conversation.to_record();
                conversations
                    .entry(uuid)
                    .or_default()
                    .push(record.conversation);
                contexts.entry(uuid).or_default().push(record.context);

                let path = payloads.join(format!("{}_{}.json", uuid, conversation.trial()));
                write_json(&path, &record.payloads)?;
            }
        }

        write_json(&folder.join(CONVERSATIONS_FILENAME), &conversations)?;
        write_json(&folder.join(CONTEXT_FILENAME), &contexts)?;
        if let Some(summary) = &self.summary {
            write_json(&folder.join(SUMMARY_FILENAME), summary)?;
        }
        std::fs::write(folder.join(CONFIG_FILENAME), self.config.to_toml()?)?;

        tracing::info!("Saved results to {}", folder.display());
        Ok(())
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use annot_ai::{HttpExchange, Request};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Replies "ok" unless the prompt mentions "fail"
    struct EchoTransport {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(&self, request: &Request) -> annot_ai::Result<HttpExchange> {
            *self.calls.lock() += 1;
            let prompt = request.messages.last().map(Message::text).unwrap_or_default();
            let finish_reason = if prompt.contains("fail") { "length" } else { "stop" };
            Ok(HttpExchange {
                status_code: 200,
                response_body: json!({
                    "id": "gen",
                    "created": 1,
                    "model": request.model,
                    "object": "chat.completion",
                    "choices": [{
                        "finish_reason": finish_reason,
                        "message": {"role": "assistant", "content": "ok"}
                    }]
                }),
                elapsed_time: 0.1,
                ..Default::default()
            })
        }
    }

    const CONFIG: &str = r#"
        max_requests_per_second = 50
        num_trials_per_publication = 2

        [endpoint]
        dry_run = true

        [conversation]
        model = "test/model"

        [[conversation.turns]]
        name = "ask"

        [[conversation.turns.request_handlers]]
        type = "AddUserMessage"
        message = "{publication}"
    "#;

    fn publications() -> Vec<Publication> {
        vec![
            Publication {
                uuid: "aaa".into(),
                text: "a fine paper".into(),
            },
            Publication {
                uuid: "bbb".into(),
                text: "a paper that will fail".into(),
            },
        ]
    }

    #[test]
    fn test_config_from_toml() {
        let config = ExperimentConfig::from_toml(CONFIG).unwrap();
        assert_eq!(config.num_trials_per_publication, 2);
        assert!(config.endpoint.dry_run);
        assert_eq!(config.conversation.turns[0].request_handlers[0].handler_type, "AddUserMessage");

        let queue = config.queue_config();
        assert_eq!(queue.max_retries, 2);
        assert_eq!(queue.min_rps, 1.0);
        assert_eq!(queue.max_rps, 50.0);
    }

    #[test]
    fn test_config_rejects_bad_rate() {
        let text = CONFIG.replace("= 50", "= 0");
        assert!(ExperimentConfig::from_toml(&text).is_err());
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut config = ExperimentConfig::from_toml(CONFIG).unwrap();
        config.endpoint.api_key = Some("sk-secret".into());
        let text = config.to_toml().unwrap();
        assert!(!text.contains("sk-secret"));
        let back = ExperimentConfig::from_toml(&text).unwrap();
        assert_eq!(back.conversation, config.conversation);
    }

    #[tokio::test]
    async fn test_run_and_save() {
        let config = ExperimentConfig::from_toml(CONFIG).unwrap();
        let transport = Arc::new(EchoTransport {
            calls: Mutex::new(0),
        });
        let registry = HandlerRegistry::with_builtins(None);
        let mut experiment = Experiment::new(
            config,
            &publications(),
            Some(&json!({"types": []})),
            &registry,
            transport.clone(),
        )
        .unwrap();

        let summary = experiment.run().await;
        assert_eq!(summary.conversations, 4);
        assert_eq!(summary.failed, 2);
        // Protocol errors are not retried
        assert_eq!(*transport.calls.lock(), 4);

        let folder = std::env::temp_dir().join(format!("annot-test-{}", uuid::Uuid::new_v4()));
        experiment.save(&folder).unwrap();

        let read = |name: &str| -> Value {
            serde_json::from_str(&std::fs::read_to_string(folder.join(name)).unwrap()).unwrap()
        };

        let conversations = read(CONVERSATIONS_FILENAME);
        assert_eq!(conversations["aaa"].as_array().unwrap().len(), 2);
        assert_eq!(conversations["aaa"][0][1]["role"], "assistant");

        let contexts = read(CONTEXT_FILENAME);
        assert_eq!(contexts["aaa"][1]["succeeded"], true);
        assert_eq!(contexts["bbb"][0]["succeeded"], false);
        assert_eq!(contexts["bbb"][0]["schema"], json!({"types": []}));

        assert!(folder.join(PAYLOADS_FOLDER).join("bbb_1.json").exists());
        assert!(folder.join(SUMMARY_FILENAME).exists());
        assert!(folder.join(CONFIG_FILENAME).exists());

        std::fs::remove_dir_all(&folder).unwrap();
    }
}
