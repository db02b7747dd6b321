// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Markdown-safe stream buffering.
//!
//! Accumulates streamed text and releases it only at points where the
//! prefix renders standalone without breaking a construct that spans the
//! boundary — never inside an open code fence, never mid-list-item, never
//! with an unmatched inline backtick.  The parser probe (pulldown-cmark)
//! decides *when* to release; the downstream renderer re-parses releases
//! to decide *what* to display.

use std::sync::Mutex;

use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag};
use regex::Regex;
use std::sync::OnceLock;

/// Default ceiling before a forced release (large enough for big code blocks).
const MAX_BUFFER_SIZE: usize = 65_000;

/// Separate, smaller ceiling while inside a list, so long lists still render
/// incrementally instead of arriving all at once.
const MAX_LIST_BUFFER_SIZE: usize = 8_000;

fn list_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([-*+]|\d+\.)\s+").expect("static regex"))
}

fn bare_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([-*+]|\d+\.)$").expect("static regex"))
}

fn open_html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([a-zA-Z][a-zA-Z0-9]*)(\s[^>]*)?>").expect("static regex"))
}

fn close_html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</([a-zA-Z][a-zA-Z0-9]*)\s*>").expect("static regex"))
}

struct BufferState {
    buffer: String,
    has_rendered_once: bool,
}

/// One instance per streamed assistant turn; discarded after the final
/// flush.  `add` and `flush` are serialized by the internal mutex.
pub struct MarkdownStreamBuffer {
    state: Mutex<BufferState>,
    max_buffer_size: usize,
    max_list_buffer_size: usize,
}

impl MarkdownStreamBuffer {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUFFER_SIZE, MAX_LIST_BUFFER_SIZE)
    }

    pub fn with_limits(max_buffer_size: usize, max_list_buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                buffer: String::new(),
                has_rendered_once: false,
            }),
            max_buffer_size,
            max_list_buffer_size,
        }
    }

    /// Append a chunk; returns a release when the accumulated buffer is safe
    /// to render standalone, `None` to keep waiting.
    pub fn add(&self, content: &str) -> Option<String> {
        if content.is_empty() {
            return None;
        }
        let mut state = self.state.lock().expect("markdown buffer lock");
        state.buffer.push_str(content);

        if self.should_render(&state.buffer, state.has_rendered_once) {
            state.has_rendered_once = true;
            return Some(std::mem::take(&mut state.buffer));
        }
        None
    }

    /// Drain whatever remains (stream end).
    pub fn flush(&self) -> String {
        let mut state = self.state.lock().expect("markdown buffer lock");
        std::mem::take(&mut state.buffer)
    }

    fn should_render(&self, buffer: &str, has_rendered_once: bool) -> bool {
        if buffer.is_empty() {
            return false;
        }

        // 1. List context has its own smaller threshold so long lists render
        //    incrementally, releasing at line boundaries when possible.
        if is_in_list_context(buffer) && buffer.len() > self.max_list_buffer_size {
            if buffer.ends_with('\n') {
                return true;
            }
            if buffer.len() > self.max_list_buffer_size * 3 / 2 {
                return true;
            }
        }

        // 2. Oversized buffer: force-release, unless inside an open fence —
        //    a split code block renders as garbage, so fences always win.
        if buffer.len() > self.max_buffer_size {
            return !in_open_fence(buffer);
        }

        // 3. Never release inside an open fenced code block.
        if in_open_fence(buffer) {
            return false;
        }

        // 4. A fence that just cleanly closed is a natural boundary.
        let fences = buffer.matches("```").count();
        if fences > 0 && fences % 2 == 0 && buffer.trim_end().ends_with("```") {
            return true;
        }

        // 5. Paragraph break: release when everything after the last blank
        //    line is whitespace and no construct is open.  If a new list is
        //    starting right after the break, hold it together instead.
        if let Some(pos) = buffer.rfind("\n\n") {
            let after = &buffer[pos + 2..];
            if after.trim().is_empty() {
                if !is_inside_construct(buffer, false) {
                    return true;
                }
            } else if list_marker_re().is_match(after.trim_start_matches('\n')) {
                return false;
            }
        }

        // 6. Any open construct vetoes the remaining, weaker signals.
        if is_inside_construct(buffer, true) {
            return false;
        }

        // 7. Sentence terminator followed by a newline, outside lists.  The
        //    minimum-length check is skipped for the very first release so
        //    initial words are not held back.
        let sentence_end = [".\n", "!\n", "?\n", ":\n"]
            .iter()
            .any(|p| buffer.ends_with(p));
        if sentence_end {
            if is_in_list_context(buffer) {
                return false;
            }
            if has_rendered_once && buffer.trim().len() < 3 {
                return false;
            }
            return true;
        }

        // Moderately full buffer ending at a line boundary: good enough for
        // line-by-line prose outside any block construct.
        if buffer.len() > self.max_buffer_size / 4 && buffer.ends_with('\n') {
            return true;
        }

        false
    }
}

impl Default for MarkdownStreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Odd number of ``` fences → the tail of the buffer is inside a code block.
fn in_open_fence(buffer: &str) -> bool {
    buffer.matches("```").count() % 2 == 1
}

/// True when the buffer ends inside a Markdown construct that must not be
/// split across a render boundary.
fn is_inside_construct(buffer: &str, check_lists_aggressively: bool) -> bool {
    if buffer.trim().is_empty() {
        return false;
    }

    if in_open_fence(buffer) {
        return true;
    }

    // (a) Net block/inline nesting from the parser probe.
    if open_nesting(buffer) > 0 {
        return true;
    }

    // (b) Unmatched inline backtick outside fenced blocks.
    let outside_fences: String = buffer
        .split("```")
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .map(|(_, part)| part)
        .collect();
    if outside_fences.matches('`').count() % 2 == 1 {
        return true;
    }

    // (c) The last parsed block is an indented code block the tail appears
    // to continue.
    if ends_in_indented_code(buffer) {
        return true;
    }

    // (d) The tail looks like a list item still being typed.
    if check_lists_aggressively && list_tail_heuristic(buffer) {
        return true;
    }

    // (e) Basic open-HTML imbalance with an unterminated tag at the tail.
    let opens = open_html_tag_re()
        .find_iter(buffer)
        .filter(|m| !m.as_str().ends_with("/>"))
        .count();
    let closes = close_html_tag_re().find_iter(buffer).count();
    if opens > closes {
        let last_lt = buffer.rfind('<');
        let last_gt = buffer.rfind('>');
        match (last_lt, last_gt) {
            (Some(lt), Some(gt)) if lt > gt => return true,
            (Some(_), None) => return true,
            _ => {}
        }
    }

    false
}

/// Start/End balance over the parser's event stream.
fn open_nesting(buffer: &str) -> i32 {
    let mut nesting = 0i32;
    for event in Parser::new(buffer) {
        match event {
            Event::Start(_) => nesting += 1,
            Event::End(_) => nesting -= 1,
            _ => {}
        }
    }
    nesting
}

/// Whether the final block-level construct the parser saw is an indented
/// code block — streamed indented code keeps extending it, so the buffer
/// tail is almost certainly a continuation.
fn ends_in_indented_code(buffer: &str) -> bool {
    #[derive(PartialEq)]
    enum LastBlock {
        None,
        IndentedCode,
        Other,
    }
    let mut last = LastBlock::None;
    for event in Parser::new(buffer) {
        if let Event::Start(tag) = event {
            last = match tag {
                Tag::CodeBlock(CodeBlockKind::Indented) => LastBlock::IndentedCode,
                Tag::CodeBlock(_)
                | Tag::Paragraph
                | Tag::Heading { .. }
                | Tag::BlockQuote(_)
                | Tag::List(_)
                | Tag::Table(_)
                | Tag::HtmlBlock => LastBlock::Other,
                _ => last,
            };
        }
    }
    last == LastBlock::IndentedCode
}

/// The last line is a list marker (with or without item text yet) and no
/// blank line has terminated the item.
fn list_tail_heuristic(buffer: &str) -> bool {
    if buffer.ends_with("\n\n") {
        return false;
    }
    let last_line = buffer.split('\n').next_back().unwrap_or("");
    list_marker_re().is_match(last_line) || bare_marker_re().is_match(last_line.trim_end())
}

/// List context for the sentence-end rule: a marker within the last five
/// non-empty lines (and no closing blank line), or a continuation indent on
/// the last non-empty line.
fn is_in_list_context(buffer: &str) -> bool {
    if buffer.is_empty() {
        return false;
    }
    let non_empty: Vec<&str> = buffer.lines().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.is_empty() {
        return false;
    }
    let recent = &non_empty[non_empty.len().saturating_sub(5)..];
    let has_marker = recent.iter().any(|l| list_marker_re().is_match(l));
    if has_marker && !buffer.ends_with("\n\n") {
        return true;
    }
    non_empty[non_empty.len() - 1].starts_with("  ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
