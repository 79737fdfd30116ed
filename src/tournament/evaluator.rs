// Candidate evaluators
//
// An evaluator scores a batch of candidate parameter sets. The scheduler never
// looks inside one: it hands over the batch plus a context object and expects
// one fitness per candidate back, in order, plus an opaque artifact map.

use super::search::Params;
use crate::config::EvaluatorConfig;
use crate::error::{EvolverError, Result};
use crate::retry::AsyncOperation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// What the evaluator is being asked about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub tournament_id: String,
    pub question_id: String,
    pub hypothesis: String,
    pub category: String,
}

/// Evaluator output: one fitness per candidate, same order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationBatch {
    pub fitnesses: Vec<f64>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,
}

/// Owned input of one batch call, shared across retry attempts
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationInput {
    pub candidates: Vec<Params>,
    pub context: EvaluationContext,
}

/// Trait for domain-specific evaluation strategies
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluator name (for logging and config lookup)
    fn name(&self) -> &str;

    /// Score every candidate of the batch
    async fn evaluate(&self, candidates: &[Params], context: &EvaluationContext) -> Result<EvaluationBatch>;
}

/// Check a batch against the number of candidates it was asked to score
pub fn check_batch(batch: &EvaluationBatch, expected: usize, evaluator: &str) -> Result<()> {
    if batch.fitnesses.len() != expected {
        return Err(EvolverError::Evaluation(format!(
            "{} returned {} fitness values for {} candidates",
            evaluator,
            batch.fitnesses.len(),
            expected
        )));
    }
    if let Some(bad) = batch.fitnesses.iter().find(|f| !f.is_finite()) {
        return Err(EvolverError::Evaluation(format!(
            "{} returned non-finite fitness {}",
            evaluator, bad
        )));
    }
    Ok(())
}

/// Adapt an evaluator to the retry executor; malformed batches count as failures
pub fn evaluator_operation(
    evaluator: Arc<dyn Evaluator>,
) -> impl AsyncOperation<Arc<EvaluationInput>, EvaluationBatch, EvolverError> {
    move |input: Arc<EvaluationInput>| {
        let evaluator = Arc::clone(&evaluator);
        async move {
            let batch = evaluator.evaluate(&input.candidates, &input.context).await?;
            check_batch(&batch, input.candidates.len(), evaluator.name())?;
            Ok::<_, EvolverError>(batch)
        }
    }
}

/// Typed evaluator lookup, built once at startup
#[derive(Default, Clone)]
pub struct EvaluatorRegistry {
    evaluators: BTreeMap<String, Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command evaluators for every configured entry
    pub fn from_config(configs: &BTreeMap<String, EvaluatorConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in configs {
            registry.register(Arc::new(CommandEvaluator::from_config(name, config)?))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, evaluator: Arc<dyn Evaluator>) -> Result<()> {
        let name = evaluator.name().to_string();
        if self.evaluators.contains_key(&name) {
            return Err(EvolverError::AlreadyExists(format!("evaluator '{}'", name)));
        }
        self.evaluators.insert(name, evaluator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Evaluator>> {
        self.evaluators
            .get(name)
            .cloned()
            .ok_or_else(|| EvolverError::NotFound(format!("evaluator '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.evaluators.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.evaluators.keys().map(String::as_str)
    }
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    candidates: &'a [Params],
    context: &'a EvaluationContext,
}

/// Runs an external program per batch
///
/// The request `{candidates, context}` is written as JSON to the child's
/// stdin; the child prints `{fitnesses, artifacts}` as JSON on stdout. The
/// child is killed if the evaluation future is dropped (e.g. on timeout).
pub struct CommandEvaluator {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandEvaluator {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(name: &str, config: &EvaluatorConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| EvolverError::InvalidInput(format!("evaluator '{}' has an empty command", name)))?;
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
        })
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, candidates: &[Params], context: &EvaluationContext) -> Result<EvaluationBatch> {
        let payload = serde_json::to_vec(&CommandRequest { candidates, context })?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(evaluator = %self.name, candidates = candidates.len(), "spawning evaluator");
        let mut child = command
            .spawn()
            .map_err(|e| EvolverError::Evaluation(format!("{}: failed to spawn {}: {}", self.name, self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EvolverError::Evaluation(format!("{}: stdin unavailable", self.name)))?;
        let write = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };
        let (_, output) = tokio::try_join!(write, child.wait_with_output())?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EvolverError::Evaluation(format!(
                "{} exited with {}: {}",
                self.name,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| EvolverError::Evaluation(format!("{}: unreadable output: {}", self.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant(f64);

    #[async_trait]
    impl Evaluator for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        async fn evaluate(&self, candidates: &[Params], _context: &EvaluationContext) -> Result<EvaluationBatch> {
            Ok(EvaluationBatch {
                fitnesses: vec![self.0; candidates.len()],
                artifacts: BTreeMap::new(),
            })
        }
    }

    fn context() -> EvaluationContext {
        EvaluationContext {
            tournament_id: "t1".to_string(),
            question_id: "q1".to_string(),
            hypothesis: "h".to_string(),
            category: "vm".to_string(),
        }
    }

    fn params(n: usize) -> Vec<Params> {
        (0..n)
            .map(|i| {
                let mut p = Params::new();
                p.insert("x".to_string(), json!(i));
                p
            })
            .collect()
    }

    #[test]
    fn test_check_batch() {
        let batch = EvaluationBatch {
            fitnesses: vec![0.1, 0.2],
            artifacts: BTreeMap::new(),
        };
        assert!(check_batch(&batch, 2, "e").is_ok());
        assert!(check_batch(&batch, 3, "e").is_err());

        let nan = EvaluationBatch {
            fitnesses: vec![f64::NAN],
            artifacts: BTreeMap::new(),
        };
        assert!(check_batch(&nan, 1, "e").is_err());
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(Constant(0.5))).unwrap();
        assert!(registry.register(Arc::new(Constant(0.7))).is_err());
        assert!(registry.get("constant").is_ok());
        assert!(matches!(registry.get("missing"), Err(EvolverError::NotFound(_))));
    }

    #[test]
    fn test_from_config_rejects_empty_command() {
        let config = EvaluatorConfig::default();
        assert!(CommandEvaluator::from_config("empty", &config).is_err());
    }

    #[tokio::test]
    async fn test_operation_checks_batch_length() {
        struct Short;

        #[async_trait]
        impl Evaluator for Short {
            fn name(&self) -> &str {
                "short"
            }

            async fn evaluate(&self, _: &[Params], _: &EvaluationContext) -> Result<EvaluationBatch> {
                Ok(EvaluationBatch::default())
            }
        }

        let input = Arc::new(EvaluationInput {
            candidates: params(2),
            context: context(),
        });
        let ok = evaluator_operation(Arc::new(Constant(0.4)));
        assert_eq!(ok.call(Arc::clone(&input)).await.unwrap().fitnesses, vec![0.4, 0.4]);

        let short = evaluator_operation(Arc::new(Short));
        assert!(short.call(input).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_evaluator_round_trip() {
        let evaluator = CommandEvaluator::new(
            "echo",
            "sh",
            vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo '{"fitnesses":[0.25,0.75],"artifacts":{"note":"ok"}}'"#.to_string(),
            ],
        );
        let batch = evaluator.evaluate(&params(2), &context()).await.unwrap();
        assert_eq!(batch.fitnesses, vec![0.25, 0.75]);
        assert_eq!(batch.artifacts["note"], json!("ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_evaluator_reports_exit_status() {
        let evaluator = CommandEvaluator::new(
            "fails",
            "sh",
            vec!["-c".to_string(), "cat > /dev/null; echo broken >&2; exit 3".to_string()],
        );
        let err = evaluator.evaluate(&params(1), &context()).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
