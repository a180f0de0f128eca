//! Folding streamed chunks into a whole response, and the reverse.

use std::collections::BTreeMap;

use super::{
    RawFields, UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedMessage,
    UnifiedResponse, UnifiedRole, UnifiedUsage,
};

/// Reassembles a [`UnifiedResponse`] from chunks in arrival order.
#[derive(Debug, Clone, Default)]
pub struct UnifiedResponseBuilder {
    id: String,
    model: String,
    created: u64,
    content: Vec<UnifiedContent>,
    /// Tool ordinal -> position in `content`.
    tool_positions: BTreeMap<u32, usize>,
    finish_reason: Option<UnifiedFinishReason>,
    usage: UnifiedUsage,
}

impl UnifiedResponseBuilder {
    pub fn new(created: u64) -> Self {
        Self {
            created,
            ..Default::default()
        }
    }

    pub fn push(&mut self, chunk: &UnifiedChunk) {
        if self.id.is_empty() {
            self.id.clone_from(&chunk.id);
        }

        if self.model.is_empty() {
            self.model.clone_from(&chunk.model);
        }

        match &chunk.delta {
            Some(UnifiedDelta::Text { text }) => match self.content.last_mut() {
                Some(UnifiedContent::Text { text: existing }) => existing.push_str(text),
                _ => self.content.push(UnifiedContent::text(text.clone())),
            },
            Some(UnifiedDelta::Image { source, mime_type }) => self.content.push(UnifiedContent::Image {
                source: source.clone(),
                mime_type: mime_type.clone(),
            }),
            Some(UnifiedDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            }) => match self.tool_positions.get(index) {
                Some(&position) => {
                    if let Some(UnifiedContent::ToolCall {
                        id: existing_id,
                        name: existing_name,
                        arguments: existing_arguments,
                    }) = self.content.get_mut(position)
                    {
                        if let Some(id) = id.as_ref().filter(|_| existing_id.is_empty()) {
                            existing_id.clone_from(id);
                        }

                        if let Some(name) = name.as_ref().filter(|_| existing_name.is_empty()) {
                            existing_name.clone_from(name);
                        }

                        existing_arguments.push_str(arguments);
                    }
                }
                None => {
                    self.tool_positions.insert(*index, self.content.len());
                    self.content.push(UnifiedContent::ToolCall {
                        id: id.clone().unwrap_or_default(),
                        name: name.clone().unwrap_or_default(),
                        arguments: arguments.clone(),
                    });
                }
            },
            None => (),
        }

        if let Some(reason) = chunk.finish_reason {
            self.finish_reason = Some(reason);
        }

        if let Some(usage) = chunk.usage {
            self.usage = usage;
        }
    }

    /// Content collected so far.
    pub fn content(&self) -> &[UnifiedContent] {
        &self.content
    }

    pub fn usage(&self) -> UnifiedUsage {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<UnifiedFinishReason> {
        self.finish_reason
    }

    pub fn build(self) -> UnifiedResponse {
        UnifiedResponse {
            id: self.id,
            model: self.model,
            created: self.created,
            choices: vec![UnifiedChoice {
                index: 0,
                message: UnifiedMessage::new(UnifiedRole::Assistant, self.content),
                finish_reason: self.finish_reason.unwrap_or(UnifiedFinishReason::Stop),
            }],
            usage: self.usage,
            raw: RawFields::default(),
        }
    }
}

impl FromIterator<UnifiedChunk> for UnifiedResponse {
    fn from_iter<T: IntoIterator<Item = UnifiedChunk>>(iter: T) -> Self {
        let mut builder = UnifiedResponseBuilder::default();

        for chunk in iter {
            builder.push(&chunk);
        }

        builder.build()
    }
}

impl UnifiedResponse {
    /// Split a whole response into the chunks a stream of it would carry.
    ///
    /// Only the first choice is streamed.
    pub fn into_chunks(self) -> Vec<UnifiedChunk> {
        let Some(choice) = self.choices.into_iter().next() else {
            return vec![UnifiedChunk {
                id: self.id,
                model: self.model,
                delta: None,
                finish_reason: Some(UnifiedFinishReason::Stop),
                usage: Some(self.usage),
            }];
        };

        let chunk = |delta| UnifiedChunk {
            id: self.id.clone(),
            model: self.model.clone(),
            delta: Some(delta),
            finish_reason: None,
            usage: None,
        };

        let mut chunks = Vec::with_capacity(choice.message.content.len() + 1);
        let mut tool_index = 0;

        for part in choice.message.content {
            let delta = match part {
                UnifiedContent::Text { text } => UnifiedDelta::Text { text },
                UnifiedContent::Image { source, mime_type } => UnifiedDelta::Image { source, mime_type },
                UnifiedContent::ToolCall { id, name, arguments } => {
                    tool_index += 1;

                    UnifiedDelta::ToolCall {
                        index: tool_index - 1,
                        id: Some(id),
                        name: Some(name),
                        arguments,
                    }
                }
                // Tool results never appear in model output.
                UnifiedContent::ToolResult { .. } => continue,
            };

            chunks.push(chunk(delta));
        }

        chunks.push(UnifiedChunk {
            id: self.id.clone(),
            model: self.model.clone(),
            delta: None,
            finish_reason: Some(choice.finish_reason),
            usage: Some(self.usage),
        });

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(delta: UnifiedDelta) -> UnifiedChunk {
        UnifiedChunk {
            id: "resp_1".into(),
            model: "gpt-4".into(),
            delta: Some(delta),
            finish_reason: None,
            usage: None,
        }
    }

    #[test]
    fn folds_text_and_tool_fragments() {
        let chunks = vec![
            delta(UnifiedDelta::Text { text: "Hel".into() }),
            delta(UnifiedDelta::Text { text: "lo".into() }),
            delta(UnifiedDelta::ToolCall {
                index: 0,
                id: Some("call_1".into()),
                name: Some("lookup".into()),
                arguments: "{\"q\":".into(),
            }),
            delta(UnifiedDelta::ToolCall {
                index: 0,
                id: None,
                name: None,
                arguments: "\"rust\"}".into(),
            }),
            UnifiedChunk {
                id: "resp_1".into(),
                model: "gpt-4".into(),
                delta: None,
                finish_reason: Some(UnifiedFinishReason::ToolCalls),
                usage: Some(UnifiedUsage::new(10, 5)),
            },
        ];

        let response: UnifiedResponse = chunks.into_iter().collect();
        let choice = response.first_choice().unwrap();

        assert_eq!(response.id, "resp_1");
        assert_eq!(choice.finish_reason, UnifiedFinishReason::ToolCalls);
        assert_eq!(response.usage, UnifiedUsage::new(10, 5));
        assert_eq!(
            choice.message.content,
            vec![
                UnifiedContent::text("Hello"),
                UnifiedContent::ToolCall {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    arguments: "{\"q\":\"rust\"}".into(),
                },
            ]
        );
    }

    #[test]
    fn splitting_and_folding_agree() {
        let response = UnifiedResponse {
            id: "r".into(),
            model: "m".into(),
            created: 0,
            choices: vec![UnifiedChoice {
                index: 0,
                message: UnifiedMessage::new(
                    UnifiedRole::Assistant,
                    vec![
                        UnifiedContent::text("Checking."),
                        UnifiedContent::ToolCall {
                            id: "a".into(),
                            name: "f".into(),
                            arguments: "{}".into(),
                        },
                    ],
                ),
                finish_reason: UnifiedFinishReason::ToolCalls,
            }],
            usage: UnifiedUsage::new(3, 4),
            raw: RawFields::default(),
        };

        let chunks = response.clone().into_chunks();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_terminal());

        let folded: UnifiedResponse = chunks.into_iter().collect();
        assert_eq!(folded, response);
    }
}
