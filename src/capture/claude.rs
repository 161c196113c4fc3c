//! Claude adapter. Completion requests carry a flat `prompt` field; the
//! response streams SSE events (`message_start`, `content_block_delta`,
//! `message_stop`).

use serde_json::Value;

use super::{
    estimate_tokens, ExtractedPrompt, LineBuffer, ResponseSummary, Site,
    SiteAdapter, StreamParser,
};

fn is_completion_url(url: &str) -> bool {
    url.contains("claude.ai/api/organizations") && url.contains("/completion")
}

pub struct Claude;

impl SiteAdapter for Claude {
    fn site(&self) -> Site {
        Site::Claude
    }

    fn is_prompt_request(&self, url: &str, method: &str) -> bool {
        method.eq_ignore_ascii_case("POST") && is_completion_url(url)
    }

    fn is_stream_response(&self, url: &str) -> bool {
        is_completion_url(url)
    }

    fn extract_prompt(
        &self,
        _url: &str,
        body: &str,
    ) -> Option<ExtractedPrompt> {
        let body: Value = serde_json::from_str(body).ok()?;
        let text = body.get("prompt")?.as_str()?.to_string();
        if text.is_empty() {
            return None;
        }
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
            .map(str::to_string);
        Some(ExtractedPrompt { text, model })
    }

    fn stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(ClaudeStream::default())
    }
}

#[derive(Default)]
pub struct ClaudeStream {
    lines: LineBuffer,
    text: String,
    model: Option<String>,
}

impl StreamParser for ClaudeStream {
    fn consume_fragment(&mut self, raw: &str) -> Vec<ResponseSummary> {
        let mut finished = Vec::new();
        for line in self.lines.push(raw) {
            let trimmed = line.trim();
            let Some(data) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(data.trim())
            else {
                // Non-JSON fragments are expected; skip and keep going.
                continue;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    if let Some(model) = value
                        .pointer("/message/model")
                        .and_then(Value::as_str)
                        .filter(|model| !model.is_empty())
                    {
                        self.model = Some(model.to_string());
                    }
                }
                Some("content_block_delta") => {
                    if value.pointer("/delta/type").and_then(Value::as_str)
                        == Some("text_delta")
                    {
                        if let Some(text) = value
                            .pointer("/delta/text")
                            .and_then(Value::as_str)
                        {
                            self.text.push_str(text);
                        }
                    }
                }
                Some("message_stop") => {
                    if !self.text.is_empty() {
                        let output_tokens = estimate_tokens(&self.text);
                        self.text.clear();
                        finished.push(ResponseSummary {
                            model: self.model.clone(),
                            output_tokens,
                        });
                    }
                }
                _ => {}
            }
        }
        finished
    }

    fn finish(&mut self) -> Option<ResponseSummary> {
        // message_stop is the sentinel; anything left is an abandoned
        // turn.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{Claude, SiteAdapter};

    const URL: &str =
        "https://claude.ai/api/organizations/o-1/chat_conversations/c-1/completion";

    #[test]
    fn prompt_request_matching() {
        assert!(Claude.is_prompt_request(URL, "POST"));
        assert!(!Claude.is_prompt_request(URL, "GET"));
        assert!(!Claude.is_prompt_request(
            "https://claude.ai/api/organizations/o-1/chat_conversations",
            "POST",
        ));
        assert!(Claude.is_stream_response(URL));
    }

    #[test]
    fn prompt_extraction_from_flat_field() {
        let prompt = Claude
            .extract_prompt(URL, r#"{"prompt": "what is a monad?"}"#)
            .unwrap();
        assert_eq!(prompt.text, "what is a monad?");
        assert_eq!(prompt.model, None);
    }

    #[test]
    fn two_turns_in_one_stream() {
        let mut parser = Claude.stream_parser();
        let chunk = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-sonnet\"}}\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"first\"}}\n",
            "data: {\"type\":\"message_stop\"}\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"second answer\"}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        let finished = parser.consume_fragment(chunk);
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].model.as_deref(), Some("claude-3-sonnet"));
        assert_eq!(finished[0].output_tokens, 2);
        assert_eq!(finished[1].output_tokens, 4);
    }

    #[test]
    fn non_text_deltas_are_ignored() {
        let mut parser = Claude.stream_parser();
        let chunk = concat!(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{}\"}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        assert!(parser.consume_fragment(chunk).is_empty());
    }

    #[test]
    fn garbage_between_events_is_skipped() {
        let mut parser = Claude.stream_parser();
        parser.consume_fragment("event: ping\ndata: <html>nope</html>\n");
        let finished = parser.consume_fragment(concat!(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        ));
        assert_eq!(finished.len(), 1);
    }
}
