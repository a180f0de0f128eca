use std::collections::HashMap;

use indexmap::IndexMap;

use crate::messages::unified::{UnifiedChunk, UnifiedFinishReason, UnifiedResponseBuilder, UnifiedUsage};

/// Mutable bookkeeping for one direction of one stream.
///
/// Converters stay stateless; the caller owns a `StreamState` per stream and
/// hands it to every `to_canonical_chunk` or `to_native_chunk` call. Decoding
/// and encoding never share a state.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Response id, taken from the first event that carries one.
    pub id: String,
    /// Model name, taken from the first event that carries one.
    pub model: String,
    pub created: u64,

    /// Whether the opening envelope (message start, response created) was handled.
    pub started: bool,
    pub finish_reason: Option<UnifiedFinishReason>,
    pub usage: Option<UnifiedUsage>,
    pub saw_tool_call: bool,
    finished: bool,
    /// The provider reported an error inside the stream.
    failed: bool,

    /// Native tool call key (block index, output index, item id) -> unified tool ordinal.
    tool_ordinals: HashMap<String, u32>,
    next_tool_ordinal: u32,

    /// Encoding: the native content block currently open.
    pub open_block: Option<OpenBlock>,
    /// Encoding: next native block index to hand out.
    pub next_block_index: u32,
    /// Encoding: unified tool ordinal -> native block index.
    tool_blocks: HashMap<u32, u32>,
    /// Encoding: tool calls waiting until their arguments are complete.
    pub pending_tools: IndexMap<u32, PendingToolCall>,
    /// Encoding: everything emitted so far, for protocols whose final event repeats the whole response.
    pub transcript: UnifiedResponseBuilder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenBlock {
    pub index: u32,
    pub kind: BlockKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    /// Tool call with the given unified ordinal.
    Tool(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl StreamState {
    pub fn new() -> Self {
        let created = crate::converter::unix_now();

        Self {
            created,
            transcript: UnifiedResponseBuilder::new(created),
            ..Default::default()
        }
    }

    /// Fill id and model from the first event that has them.
    pub fn observe_envelope(&mut self, id: Option<&str>, model: Option<&str>) {
        if let Some(id) = id.filter(|_| self.id.is_empty()) {
            self.id = id.to_string();
        }

        if let Some(model) = model.filter(|_| self.model.is_empty()) {
            self.model = model.to_string();
        }
    }

    /// The unified ordinal for a native tool call key, allocating the next one if new.
    ///
    /// Returns `(ordinal, first_seen)`.
    pub fn tool_ordinal(&mut self, key: impl Into<String>) -> (u32, bool) {
        let key = key.into();

        if let Some(ordinal) = self.tool_ordinals.get(&key) {
            return (*ordinal, false);
        }

        let ordinal = self.new_tool_ordinal();
        self.tool_ordinals.insert(key, ordinal);

        (ordinal, true)
    }

    /// Allocate an ordinal for a tool call that arrives whole and has no native key.
    pub fn new_tool_ordinal(&mut self) -> u32 {
        let ordinal = self.next_tool_ordinal;
        self.next_tool_ordinal += 1;
        self.saw_tool_call = true;

        ordinal
    }

    /// The ordinal already assigned to a native key.
    pub fn known_tool_ordinal(&self, key: &str) -> Option<u32> {
        self.tool_ordinals.get(key).copied()
    }

    /// Hand out the next native block index for encoding.
    pub fn allocate_block(&mut self, kind: BlockKind) -> OpenBlock {
        let block = OpenBlock {
            index: self.next_block_index,
            kind,
        };

        self.next_block_index += 1;
        self.open_block = Some(block);

        if let BlockKind::Tool(ordinal) = kind {
            self.tool_blocks.insert(ordinal, block.index);
        }

        block
    }

    /// The native block index allocated for a tool ordinal.
    pub fn tool_block(&self, ordinal: u32) -> Option<u32> {
        self.tool_blocks.get(&ordinal).copied()
    }

    /// Closes the open block, returning it.
    pub fn close_block(&mut self) -> Option<OpenBlock> {
        self.open_block.take()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the stream ended on a provider-reported error rather than a finish reason.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Build a chunk with the stream envelope and the given delta.
    pub fn chunk(&self, delta: crate::messages::unified::UnifiedDelta) -> UnifiedChunk {
        UnifiedChunk {
            id: self.id.clone(),
            model: self.model.clone(),
            delta: Some(delta),
            finish_reason: None,
            usage: None,
        }
    }

    /// The terminal chunk, built from the finish reason and usage seen so far.
    ///
    /// Returns `None` once a terminal chunk was produced; a stream has exactly one.
    pub fn terminal_chunk(&mut self) -> Option<UnifiedChunk> {
        if self.finished {
            return None;
        }

        self.finished = true;

        Some(UnifiedChunk {
            id: self.id.clone(),
            model: self.model.clone(),
            delta: None,
            finish_reason: Some(self.finish_reason.unwrap_or(UnifiedFinishReason::Stop)),
            usage: Some(self.usage.unwrap_or_default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_ordinals_are_stable_per_key() {
        let mut state = StreamState::new();

        assert_eq!(state.tool_ordinal("block-1"), (0, true));
        assert_eq!(state.tool_ordinal("block-3"), (1, true));
        assert_eq!(state.tool_ordinal("block-1"), (0, false));
        assert!(state.saw_tool_call);
    }

    #[test]
    fn single_terminal_chunk() {
        let mut state = StreamState::new();
        state.usage = Some(UnifiedUsage::new(1, 2));

        let terminal = state.terminal_chunk().unwrap();

        assert_eq!(terminal.finish_reason, Some(UnifiedFinishReason::Stop));
        assert_eq!(terminal.usage, Some(UnifiedUsage::new(1, 2)));
        assert!(state.terminal_chunk().is_none());
    }
}
