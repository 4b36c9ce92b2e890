//! External collaborator interfaces
//!
//! The core consumes these as narrow capabilities and treats every
//! call as potentially long-running and fallible. The language model
//! backend is the only mandatory one; the rest default to inert
//! implementations from [`crate::testing`].

use async_trait::async_trait;
use guild_molecule::Molecule;
use guild_types::{AgentId, CancelToken};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a language-model invocation. Backend failures are
/// retryable from the core's point of view.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("invocation cancelled")]
    Cancelled,
}

/// One model invocation's result.
#[derive(Clone, Debug)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<serde_json::Value>,
    pub cost: f64,
    pub tokens: u64,
}

/// The language model seam.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        tools: &[String],
        working_dir: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<LlmResponse, LlmError>;

    fn supports_cancellation(&self) -> bool {
        false
    }
}

/// Persistent document store.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn get(&self, scope: &str, query: &str) -> Vec<String>;
    async fn put(&self, scope: &str, content: &str);
}

/// Entity/relationship graph.
#[async_trait]
pub trait EntityGraph: Send + Sync {
    async fn resolve(&self, references: &[String]) -> Vec<String>;
    async fn context_for(&self, entity_ids: &[String]) -> String;
}

/// Long-term learning sink; consumes molecule outcomes.
#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn on_molecule_completed(&self, molecule: &Molecule);
    async fn on_molecule_failed(&self, molecule: &Molecule, reason: &str);
    async fn patterns_for(&self, context: &str) -> Vec<String>;
}

/// Skill and capability lookup per agent.
#[async_trait]
pub trait SkillRegistry: Send + Sync {
    async fn skills_for(&self, agent_id: &AgentId) -> Vec<String>;
    async fn capabilities_for(&self, agent_id: &AgentId) -> BTreeSet<String>;
}

/// The full collaborator bundle handed to [`crate::Guild::open`].
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LlmBackend>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub entities: Arc<dyn EntityGraph>,
    pub learning: Arc<dyn LearningSink>,
    pub skills: Arc<dyn SkillRegistry>,
}

impl Collaborators {
    /// A bundle with the given model backend and inert defaults for
    /// everything else.
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self {
            llm,
            knowledge: Arc::new(crate::testing::NullKnowledge),
            entities: Arc::new(crate::testing::NullEntityGraph),
            learning: Arc::new(crate::testing::NullLearning::default()),
            skills: Arc::new(crate::testing::NullSkills),
        }
    }
}
