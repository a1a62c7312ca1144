//! Message-history assembler (C8).
//!
//! Converts one iteration's event sequence into the provider-shaped messages the *next*
//! iteration's [`prepare_messages`] will prepend to. Only a handful of event kinds carry
//! anything worth remembering; deltas, thoughts, task-lifecycle events, and anything tagged with
//! a `parent_task_id` (a sub-task's events, per the agent-as-tool exclusion in C5) are dropped.

use crate::runtime::client_wrapper::{Message, NativeToolCall, Role};
use crate::runtime::event::{Event, EventKind};
use crate::runtime::loop_context::{LoopContext, SkillPrompt};

/// Fold one iteration's events into zero or more history messages, in emission order.
///
/// - `content-complete` with non-empty content → an assistant message with no tool calls.
/// - `content-complete` carrying assembled tool calls → an assistant message whose content is
///   empty and whose `tool_calls` list is populated instead (both may apply: a provider can
///   return narration alongside a tool call, producing two messages here).
/// - `tool-complete` → a tool message whose content is the stringified result on success, or the
///   error string on failure.
/// - Events with `parent_task_id` set are a child agent's events surfacing through the parent's
///   stream (C5 agent-as-tool propagation) and are never folded into this history.
/// - Everything else (`content-delta`, `thought-stream`, `task-*`, `tool-start`, `tool-progress`,
///   `artifact-update`, `internal:*`, `authentication`, `sub-agent-linked`) is ignored.
pub fn events_to_messages(events: &[Event]) -> Vec<Message> {
    let mut messages = Vec::new();
    for event in events {
        if event.parent_task_id.is_some() {
            continue;
        }
        match &event.kind {
            EventKind::ContentComplete { content, tool_calls, .. } => {
                if !content.is_empty() {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: content.as_str().into(),
                        tool_calls: Vec::new(),
                        name: None,
                    });
                }
                if !tool_calls.is_empty() {
                    let native = tool_calls
                        .iter()
                        .map(|call| NativeToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        })
                        .collect();
                    messages.push(Message {
                        role: Role::Assistant,
                        content: "".into(),
                        tool_calls: native,
                        name: None,
                    });
                }
            }
            EventKind::ToolComplete { tool_call_id, tool_name, success, result, error } => {
                let content = if *success {
                    result
                        .as_ref()
                        .map(stringify_result)
                        .unwrap_or_default()
                } else {
                    error.clone().unwrap_or_default()
                };
                messages.push(Message {
                    role: Role::Tool { call_id: tool_call_id.clone() },
                    content: content.as_str().into(),
                    tool_calls: Vec::new(),
                    name: Some(tool_name.clone()),
                });
            }
            _ => {}
        }
    }
    messages
}

fn stringify_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Prepare the message list the iteration executor (C6) hands to the provider: system prompt
/// first (if present), then each skill prompt in registration order, then history verbatim.
pub fn prepare_messages(loop_ctx: &LoopContext, history: &[Message]) -> Vec<Message> {
    let mut prepared = Vec::with_capacity(1 + loop_ctx.skill_prompts.len() + history.len());
    if let Some(system_prompt) = &loop_ctx.system_prompt {
        prepared.push(Message {
            role: Role::System,
            content: system_prompt.as_str().into(),
            tool_calls: Vec::new(),
            name: Some("system-prompt".to_string()),
        });
    }
    for SkillPrompt { name, prompt } in &loop_ctx.skill_prompts {
        prepared.push(Message {
            role: Role::System,
            content: prompt.as_str().into(),
            tool_calls: Vec::new(),
            name: Some(name.clone()),
        });
    }
    prepared.extend(history.iter().cloned());
    prepared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event::FinishReason;
    use crate::runtime::tool_protocol::ToolCall;
    use serde_json::json;

    fn event(kind: EventKind) -> Event {
        Event::new("ctx-1", "task-1", kind)
    }

    #[test]
    fn content_complete_becomes_assistant_message() {
        let events = vec![event(EventKind::ContentComplete {
            content: "Hello world".to_string(),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
        })];
        let messages = events_to_messages(&events);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0].role, Role::Assistant));
        assert_eq!(&*messages[0].content, "Hello world");
        assert!(messages[0].tool_calls.is_empty());
    }

    #[test]
    fn tool_calls_and_tool_complete_assemble_in_order() {
        let events = vec![
            event(EventKind::ContentComplete {
                content: "".to_string(),
                tool_calls: vec![ToolCall {
                    id: "c1".to_string(),
                    name: "calc".to_string(),
                    arguments: json!({"x": 1, "y": 2}),
                }],
                finish_reason: FinishReason::ToolCalls,
            }),
            event(EventKind::ToolComplete {
                tool_call_id: "c1".to_string(),
                tool_name: "calc".to_string(),
                success: true,
                result: Some(json!(3)),
                error: None,
            }),
        ];
        let messages = events_to_messages(&events);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, Role::Assistant));
        assert_eq!(messages[0].tool_calls.len(), 1);
        assert_eq!(messages[0].tool_calls[0].id, "c1");
        match &messages[1].role {
            Role::Tool { call_id } => assert_eq!(call_id, "c1"),
            _ => panic!("expected tool message"),
        }
        assert_eq!(&*messages[1].content, "3");
    }

    #[test]
    fn failed_tool_complete_carries_error_as_content() {
        let events = vec![event(EventKind::ToolComplete {
            tool_call_id: "c1".to_string(),
            tool_name: "lookup".to_string(),
            success: false,
            result: None,
            error: Some("DB down".to_string()),
        })];
        let messages = events_to_messages(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(&*messages[0].content, "DB down");
    }

    #[test]
    fn child_task_events_are_excluded() {
        let events = vec![Event::new(
            "ctx-1",
            "child-task",
            EventKind::ContentComplete {
                content: "sub".to_string(),
                tool_calls: vec![],
                finish_reason: FinishReason::Stop,
            },
        )
        .with_parent_task_id("task-1")];
        assert!(events_to_messages(&events).is_empty());
    }

    #[test]
    fn deltas_and_thoughts_are_ignored() {
        let events = vec![
            event(EventKind::ContentDelta { delta: "Hi".to_string(), index: 0 }),
            event(EventKind::ThoughtStream {
                content: "reasoning".to_string(),
                thought_type: "thinking".to_string(),
                verbosity: crate::runtime::event::Verbosity::Normal,
            }),
            event(EventKind::TaskCreated),
        ];
        assert!(events_to_messages(&events).is_empty());
    }

    #[test]
    fn prepare_messages_orders_system_then_skills_then_history() {
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1")
            .with_system_prompt("be helpful")
            .with_skill_prompt("math", "you can do arithmetic");
        let history = vec![Message {
            role: Role::User,
            content: "Hi".into(),
            tool_calls: Vec::new(),
            name: None,
        }];
        let prepared = prepare_messages(&loop_ctx, &history);
        assert_eq!(prepared.len(), 3);
        assert!(matches!(prepared[0].role, Role::System));
        assert_eq!(&*prepared[0].content, "be helpful");
        assert_eq!(prepared[0].name.as_deref(), Some("system-prompt"));
        assert!(matches!(prepared[1].role, Role::System));
        assert_eq!(&*prepared[1].content, "you can do arithmetic");
        assert_eq!(prepared[1].name.as_deref(), Some("math"));
        assert!(matches!(prepared[2].role, Role::User));
    }

    #[test]
    fn tool_complete_message_carries_tool_name() {
        let events = vec![event(EventKind::ToolComplete {
            tool_call_id: "c1".to_string(),
            tool_name: "calc".to_string(),
            success: true,
            result: Some(json!(3)),
            error: None,
        })];
        let messages = events_to_messages(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name.as_deref(), Some("calc"));
    }
}
