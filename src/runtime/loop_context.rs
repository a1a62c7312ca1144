//! Immutable per-turn record.
//!
//! Built once by the host when starting a turn and threaded read-only through the turn loop (C7),
//! the iteration executor (C6), and the dispatcher (C5). Nothing downstream mutates it; a child
//! iteration or a dispatched tool call derives its own scratch state (see
//! [`crate::runtime::dispatcher::ExecContext`]) from a borrowed `LoopContext` instead of cloning
//! and mutating this one.

use std::sync::Arc;

use crate::runtime::tool_protocol::ToolProvider;

/// An auth context opaque to the core; hosts that need bearer tokens, API keys, or session
/// cookies attach whatever shape they like behind this.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: String,
    pub scopes: Vec<String>,
}

/// A named system prompt registered ahead of the conversational history, in the order the
/// iteration executor (C6) should lay them out (§4.5 step 1).
#[derive(Debug, Clone)]
pub struct SkillPrompt {
    pub name: String,
    pub prompt: String,
}

/// Everything one turn needs that doesn't change across its iterations.
#[derive(Clone)]
pub struct LoopContext {
    pub agent_id: String,
    pub context_id: String,
    pub task_id: String,
    pub turn_number: u32,
    pub system_prompt: Option<String>,
    pub skill_prompts: Vec<SkillPrompt>,
    pub tool_providers: Vec<Arc<dyn ToolProvider>>,
    /// Scope tags already accumulated before this turn started — non-empty only when this turn is
    /// itself running as a sub-task of an agent-as-tool call (§4.4).
    pub parent_trace_scope: Vec<String>,
    pub auth: Option<AuthContext>,
}

impl LoopContext {
    pub fn new(agent_id: impl Into<String>, context_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        LoopContext {
            agent_id: agent_id.into(),
            context_id: context_id.into(),
            task_id: task_id.into(),
            turn_number: 0,
            system_prompt: None,
            skill_prompts: Vec::new(),
            tool_providers: Vec::new(),
            parent_trace_scope: Vec::new(),
            auth: None,
        }
    }

    /// Like [`LoopContext::new`], but generates a fresh `contextId`/`taskId` pair (§A) for hosts
    /// that don't track their own task identifiers across turns.
    pub fn start(agent_id: impl Into<String>) -> Self {
        LoopContext::new(agent_id, uuid::Uuid::new_v4().to_string(), uuid::Uuid::new_v4().to_string())
    }

    pub fn with_turn_number(mut self, turn_number: u32) -> Self {
        self.turn_number = turn_number;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_skill_prompt(mut self, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.skill_prompts.push(SkillPrompt {
            name: name.into(),
            prompt: prompt.into(),
        });
        self
    }

    pub fn with_tool_provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.tool_providers.push(provider);
        self
    }

    pub fn with_parent_trace_scope(mut self, scope: Vec<String>) -> Self {
        self.parent_trace_scope = scope;
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = Some(auth);
        self
    }
}
