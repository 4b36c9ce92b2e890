//! Deterministic collaborator doubles
//!
//! Used by the runtime's own tests and available to downstream test
//! suites. The scripted backend replays canned responses in order and
//! falls back to echoing the prompt.

use crate::collaborators::{
    EntityGraph, KnowledgeStore, LearningSink, LlmBackend, LlmError, LlmResponse, SkillRegistry,
};
use async_trait::async_trait;
use guild_molecule::Molecule;
use guild_types::{AgentId, CancelToken};
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Replays scripted responses; echoes the prompt once the script is
/// exhausted.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    /// Cost attributed to echoed (unscripted) responses.
    pub default_cost: f64,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_cost: 0.1,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.default_cost = cost;
        self
    }

    /// Queue one successful response.
    pub fn respond(&self, content: impl Into<String>, cost: f64) {
        let mut script = self.script.lock().unwrap();
        script.push_back(Ok(LlmResponse {
            content: content.into(),
            tool_calls: Vec::new(),
            cost,
            tokens: 0,
        }));
    }

    /// Queue one failure.
    pub fn fail_next(&self, error: impl Into<String>) {
        let mut script = self.script.lock().unwrap();
        script.push_back(Err(LlmError::Backend(error.into())));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn execute(
        &self,
        prompt: &str,
        _tools: &[String],
        _working_dir: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<LlmResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(LlmResponse {
                content: format!("done: {prompt}"),
                tool_calls: Vec::new(),
                cost: self.default_cost,
                tokens: prompt.len() as u64,
            }),
        }
    }

    fn supports_cancellation(&self) -> bool {
        true
    }
}

/// Inert knowledge store.
pub struct NullKnowledge;

#[async_trait]
impl KnowledgeStore for NullKnowledge {
    async fn get(&self, _scope: &str, _query: &str) -> Vec<String> {
        Vec::new()
    }

    async fn put(&self, _scope: &str, _content: &str) {}
}

/// Inert entity graph.
pub struct NullEntityGraph;

#[async_trait]
impl EntityGraph for NullEntityGraph {
    async fn resolve(&self, _references: &[String]) -> Vec<String> {
        Vec::new()
    }

    async fn context_for(&self, _entity_ids: &[String]) -> String {
        String::new()
    }
}

/// Counts outcomes without learning anything.
#[derive(Default)]
pub struct NullLearning {
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
}

#[async_trait]
impl LearningSink for NullLearning {
    async fn on_molecule_completed(&self, _molecule: &Molecule) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_molecule_failed(&self, _molecule: &Molecule, _reason: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    async fn patterns_for(&self, _context: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Empty skill registry.
pub struct NullSkills;

#[async_trait]
impl SkillRegistry for NullSkills {
    async fn skills_for(&self, _agent_id: &AgentId) -> Vec<String> {
        Vec::new()
    }

    async fn capabilities_for(&self, _agent_id: &AgentId) -> BTreeSet<String> {
        BTreeSet::new()
    }
}
