// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic transcript compaction.
//!
//! Messages are scored by recency (exponential decay) and role weight
//! (tool > user > assistant prose) and evicted lowest-score-first until
//! the estimate drops to the target.  Tool-interaction groups (an
//! assistant tool-call run plus its results) are evicted as a unit so the
//! transcript never contains an orphaned tool message.  System messages
//! are never evicted.
//!
//! Compaction is idempotent: a second run with no intervening appends
//! evicts nothing and adds nothing.

use tiller_model::{Message, MessageContent, Role};

use crate::session::MessageStore;

/// Exponential decay per unit of age (in eviction units).
const RECENCY_DECAY: f64 = 0.05;

/// The outcome of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactReport {
    pub before: usize,
    pub after: usize,
    pub freed: usize,
}

/// One evictable unit: either a single message or a whole tool-interaction
/// group (assistant tool-calls + their tool results).
#[derive(Debug)]
struct Unit {
    /// Indices into the message list, ascending.
    indices: Vec<usize>,
    tokens: usize,
    score: f64,
    evictable: bool,
}

/// Compact the store down to `target_tokens`.  When the estimate still
/// exceeds `context_window` after eviction, the evicted span is replaced
/// by a single synthetic system notice.
pub fn compact(
    store: &mut MessageStore,
    target_tokens: usize,
    context_window: usize,
) -> CompactReport {
    let before = store.estimate_tokens();
    if before <= target_tokens {
        return CompactReport {
            before,
            after: before,
            freed: 0,
        };
    }

    let messages = store.messages();
    let units = build_units(messages);

    // Eviction order: ascending score.  Ties resolve to the older unit.
    let mut order: Vec<usize> = units
        .iter()
        .enumerate()
        .filter(|(_, u)| u.evictable)
        .map(|(i, _)| i)
        .collect();
    order.sort_by(|a, b| {
        units[*a]
            .score
            .partial_cmp(&units[*b].score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });

    let mut estimate = before;
    let mut doomed: Vec<usize> = Vec::new();
    for ui in order {
        if estimate <= target_tokens {
            break;
        }
        estimate -= units[ui].tokens;
        doomed.extend(&units[ui].indices);
    }

    if doomed.is_empty() {
        return CompactReport {
            before,
            after: before,
            freed: 0,
        };
    }
    doomed.sort_unstable();

    let removed_count = doomed.len();
    let mut kept: Vec<Message> = Vec::with_capacity(messages.len() - removed_count);
    let mut doomed_iter = doomed.iter().peekable();
    for (i, m) in messages.iter().enumerate() {
        if doomed_iter.peek() == Some(&&i) {
            doomed_iter.next();
        } else {
            kept.push(m.clone());
        }
    }

    let freed = before.saturating_sub(estimate);
    // Replace the evicted span with a short deterministic summary when the
    // transcript is still over the window.
    if estimate > context_window {
        let notice = Message::system(format!(
            "earlier conversation compacted: {removed_count} messages removed, {}tok freed",
            freed
        ));
        let at = if kept.is_empty() { 0 } else { 1 };
        kept.insert(at, notice);
    }

    store.replace(kept);
    let after = store.estimate_tokens();
    CompactReport {
        before,
        after,
        freed,
    }
}

/// Group messages into eviction units and score them.
fn build_units(messages: &[Message]) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        let mut indices = vec![i];

        if m.role == Role::Assistant && matches!(m.content, MessageContent::ToolCall { .. }) {
            // Collect the whole interaction group: the consecutive
            // tool-call run plus the tool results answering those ids.
            let mut ids: Vec<&str> = vec![m.call_id().unwrap_or_default()];
            let mut seen_result = false;
            let mut j = i + 1;
            while j < messages.len() {
                match &messages[j].content {
                    // A parallel tool-call run; a new run after results
                    // starts a new interaction group.
                    MessageContent::ToolCall { .. }
                        if messages[j].role == Role::Assistant && !seen_result =>
                    {
                        ids.push(messages[j].call_id().unwrap_or_default());
                        indices.push(j);
                        j += 1;
                    }
                    MessageContent::ToolResult { tool_call_id, .. }
                        if ids.contains(&tool_call_id.as_str()) =>
                    {
                        seen_result = true;
                        indices.push(j);
                        j += 1;
                    }
                    _ => break,
                }
            }
            i = j;
        } else {
            i += 1;
        }

        let tokens: usize = indices.iter().map(|&k| messages[k].approx_tokens()).sum();
        let evictable = messages[indices[0]].role != Role::System;
        units.push(Unit {
            indices,
            tokens,
            score: 0.0,
            evictable,
        });
    }

    // Recency: newer units decay less.  Role weight from the unit's first
    // message: tool interactions > user > assistant prose.
    let n = units.len();
    for (ui, unit) in units.iter_mut().enumerate() {
        let age = (n - 1 - ui) as f64;
        let role_weight = match messages[unit.indices[0]].content {
            MessageContent::ToolCall { .. } | MessageContent::ToolResult { .. } => 3.0,
            _ => match messages[unit.indices[0]].role {
                Role::User => 2.0,
                _ => 1.0,
            },
        };
        unit.score = role_weight * (-RECENCY_DECAY * age).exp();
    }
    units
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store(filler_messages: usize) -> MessageStore {
        let mut s = MessageStore::new();
        s.append(Message::system("system prompt"));
        for i in 0..filler_messages {
            s.append(Message::user(format!("question {i} {}", "x".repeat(200))));
            s.append(Message::assistant(format!("answer {i} {}", "y".repeat(200))));
        }
        s
    }

    #[test]
    fn noop_below_target() {
        let mut s = seeded_store(2);
        let est = s.estimate_tokens();
        let report = compact(&mut s, est + 100, 10_000);
        assert_eq!(report.freed, 0);
        assert_eq!(s.estimate_tokens(), est);
    }

    #[test]
    fn evicts_down_to_target() {
        let mut s = seeded_store(20);
        let before = s.estimate_tokens();
        let target = before / 2;
        let report = compact(&mut s, target, usize::MAX);
        assert!(report.after <= target, "after={} target={target}", report.after);
        assert!(report.freed > 0);
        assert_eq!(report.before, before);
    }

    #[test]
    fn system_message_never_evicted() {
        let mut s = seeded_store(20);
        compact(&mut s, 10, usize::MAX);
        assert_eq!(s.messages()[0].role, Role::System);
        assert_eq!(s.messages()[0].as_text(), Some("system prompt"));
    }

    #[test]
    fn compaction_is_idempotent() {
        let mut s = seeded_store(20);
        let target = s.estimate_tokens() / 2;
        compact(&mut s, target, usize::MAX);
        let after_first: Vec<String> = s
            .messages()
            .iter()
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect();
        let report2 = compact(&mut s, target, usize::MAX);
        let after_second: Vec<String> = s
            .messages()
            .iter()
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect();
        assert_eq!(report2.freed, 0, "second compact must be a no-op");
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn older_messages_evicted_before_newer() {
        let mut s = seeded_store(20);
        let target = s.estimate_tokens() / 2;
        compact(&mut s, target, usize::MAX);
        let texts: Vec<&str> = s.messages().iter().filter_map(|m| m.as_text()).collect();
        // The most recent exchange must survive.
        assert!(texts.iter().any(|t| t.contains("question 19")));
        // The oldest assistant prose goes first.
        assert!(!texts.iter().any(|t| t.contains("answer 0")));
    }

    #[test]
    fn assistant_prose_evicted_before_tool_groups_of_same_age() {
        let mut s = MessageStore::new();
        s.append(Message::system("sys"));
        s.append(Message::assistant(format!("prose {}", "a".repeat(400))));
        s.append(Message::tool_call("c1", "read_file", "{\"path\":\"x\"}"));
        s.append(Message::tool_result("c1", "z".repeat(400)));
        s.append(Message::user("recent question"));

        let target = s.estimate_tokens() - 50;
        compact(&mut s, target, usize::MAX);
        let texts: Vec<&str> = s.messages().iter().filter_map(|m| m.as_text()).collect();
        assert!(
            !texts.iter().any(|t| t.starts_with("prose")),
            "assistant prose should be the first eviction"
        );
        assert!(s.is_well_formed());
    }

    #[test]
    fn tool_groups_evicted_atomically() {
        let mut s = MessageStore::new();
        s.append(Message::system("sys"));
        for i in 0..10 {
            s.append(Message::tool_call(format!("c{i}"), "read_file", "{}"));
            s.append(Message::tool_result(format!("c{i}"), "r".repeat(300)));
        }
        let target = s.estimate_tokens() / 3;
        compact(&mut s, target, usize::MAX);
        assert!(
            s.is_well_formed(),
            "no orphaned tool results after group eviction"
        );
    }

    #[test]
    fn parallel_tool_call_group_stays_together() {
        let mut s = MessageStore::new();
        s.append(Message::system("sys"));
        // Two parallel calls answered after both were issued.
        s.append(Message::tool_call("a", "read_file", "{}"));
        s.append(Message::tool_call("b", "list_dir", "{}"));
        s.append(Message::tool_result("a", "x".repeat(300)));
        s.append(Message::tool_result("b", "y".repeat(300)));
        s.append(Message::user(format!("follow-up {}", "z".repeat(300))));

        compact(&mut s, 60, usize::MAX);
        assert!(s.is_well_formed());
    }

    #[test]
    fn synthetic_notice_inserted_when_still_over_window() {
        let mut s = seeded_store(20);
        // Tiny window: even after full eviction the transcript exceeds it.
        compact(&mut s, 10, 1);
        let has_notice = s
            .messages()
            .iter()
            .any(|m| m.as_text().is_some_and(|t| t.contains("conversation compacted")));
        assert!(has_notice);
        // Well-formedness survives the insert.
        assert_eq!(s.messages()[0].role, Role::System);
    }

    #[test]
    fn no_notice_when_target_reached_within_window() {
        let mut s = seeded_store(20);
        let target = s.estimate_tokens() / 2;
        compact(&mut s, target, usize::MAX);
        let has_notice = s
            .messages()
            .iter()
            .any(|m| m.as_text().is_some_and(|t| t.contains("conversation compacted")));
        assert!(!has_notice);
    }

    #[test]
    fn report_freed_matches_before_minus_estimate() {
        let mut s = seeded_store(10);
        let target = s.estimate_tokens() / 2;
        let report = compact(&mut s, target, usize::MAX);
        assert_eq!(report.freed, report.before - report.after);
    }
}
