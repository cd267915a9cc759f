use serde::{Deserialize, Deserializer, Serialize};

/// Retry budget applied when a definition does not set one.
pub const DEFAULT_RETRIES: u32 = 3;

/// Execution policy attached to one step definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPolicy {
    /// Extra attempts allowed after the first failure.
    pub max_retries: u32,
    /// Seconds between retries; when set, retries are driven by a storage
    /// timer instead of the next in-process pass.
    pub retry_interval: Option<u64>,
    /// Seconds before an outstanding dispatch is failed permanently.
    pub timeout: Option<u64>,
    /// Forward handler completes out-of-band via external completion.
    pub async_invoke: bool,
    /// Rollback handler completes out-of-band via external completion.
    pub async_compensate: bool,
    /// Children may dispatch before this step's sibling branch completes.
    pub no_wait: bool,
    /// Step has no rollback handler; it is left alone during compensation.
    pub no_compensation: bool,
    /// A permanent failure skips the subtree instead of rolling back.
    pub continue_on_permanent_failure: bool,
    /// Inject this step's response into child payloads as `_response`.
    pub forward_response: bool,
    /// Record the handler response in the transaction context.
    pub save_response: bool,
    /// Step runs on a remote background worker.
    pub background_execution: bool,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            retry_interval: None,
            timeout: None,
            async_invoke: false,
            async_compensate: false,
            no_wait: false,
            no_compensation: false,
            continue_on_permanent_failure: false,
            forward_response: false,
            save_response: true,
            background_execution: false,
        }
    }
}

/// A node in the user-supplied step definition tree.
///
/// The root carries no action; every other node names one. `next` accepts
/// either a single definition or a list when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StepDefinition {
    pub action: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub next: Vec<StepDefinition>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<StepDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<StepDefinition>),
        One(Box<StepDefinition>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(defs) => defs,
        OneOrMany::One(def) => vec![*def],
    })
}

impl StepDefinition {
    /// Create a root definition over the given children.
    pub fn root(next: Vec<StepDefinition>) -> Self {
        Self {
            action: None,
            next,
            policy: StepPolicy::default(),
        }
    }

    /// Create a definition for a named action.
    pub fn action(name: impl Into<String>) -> Self {
        Self {
            action: Some(name.into()),
            next: Vec::new(),
            policy: StepPolicy::default(),
        }
    }

    /// Append a child definition.
    pub fn next(mut self, child: StepDefinition) -> Self {
        self.next.push(child);
        self
    }

    /// Override the retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    /// Retry through a storage timer with the given delay in seconds.
    pub fn retry_interval(mut self, seconds: u64) -> Self {
        self.policy.retry_interval = Some(seconds);
        self
    }

    /// Fail the step permanently if no completion arrives in time.
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.policy.timeout = Some(seconds);
        self
    }

    /// Mark the forward handler as completing out-of-band.
    pub fn async_invoke(mut self) -> Self {
        self.policy.async_invoke = true;
        self
    }

    /// Mark the rollback handler as completing out-of-band.
    pub fn async_compensate(mut self) -> Self {
        self.policy.async_compensate = true;
        self
    }

    /// Allow children to dispatch before the sibling branch completes.
    pub fn no_wait(mut self) -> Self {
        self.policy.no_wait = true;
        self
    }

    /// Leave this step alone during compensation.
    pub fn no_compensation(mut self) -> Self {
        self.policy.no_compensation = true;
        self
    }

    /// Skip the subtree on permanent failure instead of rolling back.
    pub fn continue_on_permanent_failure(mut self) -> Self {
        self.policy.continue_on_permanent_failure = true;
        self
    }

    /// Inject this step's response into child payloads.
    pub fn forward_response(mut self) -> Self {
        self.policy.forward_response = true;
        self
    }

    /// Do not record the handler response in the transaction context.
    pub fn discard_response(mut self) -> Self {
        self.policy.save_response = false;
        self
    }

    /// Mark the step as running on a remote background worker.
    pub fn background_execution(mut self) -> Self {
        self.policy.background_execution = true;
        self
    }

    /// Whether any step in the tree completes out-of-band.
    pub fn has_async_steps(&self) -> bool {
        self.policy.async_invoke
            || self.policy.async_compensate
            || self.next.iter().any(StepDefinition::has_async_steps)
    }

    /// Whether any step in the tree runs on a background worker.
    pub fn has_remote_steps(&self) -> bool {
        self.policy.background_execution
            || self.next.iter().any(StepDefinition::has_remote_steps)
    }
}

/// Per-model execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Seconds before the whole transaction is rolled back.
    pub timeout: Option<u64>,
    /// Persist checkpoints; disabling rejects async steps.
    pub store_execution: bool,
    /// Seconds to keep finished checkpoints archived instead of deleted.
    pub retention_time: Option<u64>,
    /// Beginning an already-checkpointed transaction rehydrates it.
    pub idempotent: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            store_execution: true,
            retention_time: None,
            idempotent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = StepPolicy::default();
        assert_eq!(policy.max_retries, DEFAULT_RETRIES);
        assert!(policy.save_response);
        assert!(!policy.async_invoke);
        assert!(policy.retry_interval.is_none());
    }

    #[test]
    fn test_builder() {
        let def = StepDefinition::root(vec![StepDefinition::action("reserve")
            .max_retries(1)
            .forward_response()
            .next(StepDefinition::action("charge").async_invoke().timeout(30))]);

        assert!(def.action.is_none());
        let reserve = &def.next[0];
        assert_eq!(reserve.action.as_deref(), Some("reserve"));
        assert_eq!(reserve.policy.max_retries, 1);
        assert!(reserve.policy.forward_response);
        let charge = &reserve.next[0];
        assert!(charge.policy.async_invoke);
        assert_eq!(charge.policy.timeout, Some(30));
        assert!(def.has_async_steps());
        assert!(!def.has_remote_steps());
    }

    #[test]
    fn test_deserialize_next_as_single_or_list() {
        let single: StepDefinition = serde_json::from_str(
            r#"{"action":"a","next":{"action":"b"}}"#,
        )
        .unwrap();
        assert_eq!(single.next.len(), 1);
        assert_eq!(single.next[0].action.as_deref(), Some("b"));

        let many: StepDefinition = serde_json::from_str(
            r#"{"action":"a","next":[{"action":"b"},{"action":"c","no_wait":true}]}"#,
        )
        .unwrap();
        assert_eq!(many.next.len(), 2);
        assert!(many.next[1].policy.no_wait);
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let def: StepDefinition = serde_json::from_str(r#"{"action":"a"}"#).unwrap();
        assert!(def.policy.save_response);
        assert_eq!(def.policy.max_retries, DEFAULT_RETRIES);
    }

    #[test]
    fn test_model_options_defaults() {
        let options = ModelOptions::default();
        assert!(options.store_execution);
        assert!(options.timeout.is_none());
        assert!(!options.idempotent);
    }

    #[test]
    fn test_definition_round_trip() {
        let def = StepDefinition::root(vec![
            StepDefinition::action("a").retry_interval(5),
            StepDefinition::action("b").no_compensation(),
        ]);
        let json = serde_json::to_string(&def).unwrap();
        let back: StepDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
    }
}
