//! ChatGPT adapter. The conversation endpoint streams SSE `data:` lines
//! whose payloads are JSON-patch-style operation batches; `data: [DONE]`
//! terminates the stream.

use serde_json::Value;

use super::{
    estimate_tokens, ExtractedPrompt, LineBuffer, ResponseSummary, Site,
    SiteAdapter, StreamParser,
};

const CONVERSATION_PATHS: &[&str] = &[
    "backend-api/conversation",
    "backend-api/f/conversation",
    "/backend-api/v2/conversation",
    "api/conversation",
];

const EXCLUDED_PATHS: &[&str] = &[
    "/prepare",
    "/stream_status",
    "/experimental/",
    "/autocompletions",
];

fn is_conversation_url(url: &str) -> bool {
    CONVERSATION_PATHS.iter().any(|path| url.contains(path))
        && !EXCLUDED_PATHS.iter().any(|path| url.contains(path))
}

pub struct ChatGpt;

impl SiteAdapter for ChatGpt {
    fn site(&self) -> Site {
        Site::ChatGpt
    }

    fn is_prompt_request(&self, url: &str, method: &str) -> bool {
        method.eq_ignore_ascii_case("POST") && is_conversation_url(url)
    }

    fn is_stream_response(&self, url: &str) -> bool {
        is_conversation_url(url) || url.contains("ces/v1/t")
    }

    fn extract_prompt(
        &self,
        _url: &str,
        body: &str,
    ) -> Option<ExtractedPrompt> {
        let body: Value = serde_json::from_str(body).ok()?;
        let messages = body.get("messages")?.as_array()?;
        let last_user = messages.iter().rev().find(|msg| {
            msg.get("role").and_then(Value::as_str) == Some("user")
                || msg.pointer("/author/role").and_then(Value::as_str)
                    == Some("user")
        })?;
        let text = match last_user.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(content) => {
                let parts = content.get("parts")?.as_array()?;
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            None => return None,
        };
        if text.is_empty() {
            return None;
        }
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(ExtractedPrompt { text, model })
    }

    fn stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(ChatGptStream::default())
    }
}

#[derive(Default)]
pub struct ChatGptStream {
    lines: LineBuffer,
    text: String,
    model: Option<String>,
}

impl ChatGptStream {
    fn consume_record(&mut self, value: &Value) {
        if let Some(model) = value.get("model").and_then(Value::as_str) {
            self.model = Some(model.to_string());
        }
        if let Some(slug) = value
            .pointer("/v/message/metadata/model_slug")
            .and_then(Value::as_str)
        {
            self.model = Some(slug.to_string());
        }
        if value.get("type").and_then(Value::as_str)
            == Some("server_ste_metadata")
        {
            if let Some(slug) = value
                .pointer("/metadata/model_slug")
                .and_then(Value::as_str)
            {
                self.model = Some(slug.to_string());
            }
        }

        // Delta batches: [{"o":"append","p":".../message/content/parts/0","v":"..."}]
        if let Some(ops) = value.get("v").and_then(Value::as_array) {
            for op in ops {
                if op.get("o").and_then(Value::as_str) == Some("append")
                    && op.get("p").and_then(Value::as_str).is_some_and(
                        |p| p.contains("/message/content/parts/"),
                    )
                {
                    if let Some(text) = op.get("v").and_then(Value::as_str) {
                        self.text.push_str(text);
                    }
                }
            }
        }

        // Initial message creation may carry the first chunk of content.
        if self.text.is_empty() {
            if let Some(first) = value
                .pointer("/v/message/content/parts/0")
                .and_then(Value::as_str)
            {
                self.text.push_str(first);
            }
        }

        // Plain delta fallbacks.
        if let Some(delta) =
            value.pointer("/delta/content").and_then(Value::as_str)
        {
            self.text.push_str(delta);
        } else if let Some(delta) = value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            self.text.push_str(delta);
        }
    }

    fn take_turn(&mut self) -> Option<ResponseSummary> {
        if self.text.is_empty() {
            return None;
        }
        let output_tokens = estimate_tokens(&self.text);
        self.text.clear();
        Some(ResponseSummary {
            model: self.model.clone(),
            output_tokens,
        })
    }
}

impl StreamParser for ChatGptStream {
    fn consume_fragment(&mut self, raw: &str) -> Vec<ResponseSummary> {
        let mut finished = Vec::new();
        for line in self.lines.push(raw) {
            let trimmed = line.trim();
            if trimmed.starts_with("event:") {
                continue;
            }
            let Some(data) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                finished.extend(self.take_turn());
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(value) => self.consume_record(&value),
                // Non-JSON fragments are expected; skip and keep going.
                Err(_) => continue,
            }
        }
        finished
    }

    fn finish(&mut self) -> Option<ResponseSummary> {
        // The terminal record is explicit; a stream that ends without
        // [DONE] was abandoned mid-turn.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatGpt, SiteAdapter};

    const URL: &str = "https://chatgpt.com/backend-api/conversation";

    #[test]
    fn prompt_request_matching() {
        let adapter = ChatGpt;
        assert!(adapter.is_prompt_request(URL, "POST"));
        assert!(!adapter.is_prompt_request(URL, "GET"));
        assert!(!adapter.is_prompt_request(
            "https://chatgpt.com/backend-api/conversation/prepare",
            "POST",
        ));
        assert!(!adapter.is_prompt_request(
            "https://chatgpt.com/backend-api/conversation/experimental/x",
            "POST",
        ));
    }

    #[test]
    fn stream_response_matching() {
        assert!(ChatGpt.is_stream_response(URL));
        assert!(ChatGpt.is_stream_response("https://chatgpt.com/ces/v1/t"));
        assert!(!ChatGpt.is_stream_response(
            "https://chatgpt.com/backend-api/conversation/stream_status",
        ));
    }

    #[test]
    fn prompt_extraction_from_message_parts() {
        let body = r#"{
            "model": "gpt-4o",
            "messages": [
                {"author": {"role": "system"}, "content": {"parts": ["be nice"]}},
                {"author": {"role": "user"}, "content": {"parts": ["tell me", "a joke"]}}
            ]
        }"#;
        let prompt = ChatGpt.extract_prompt(URL, body).unwrap();
        assert_eq!(prompt.text, "tell me a joke");
        assert_eq!(prompt.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn prompt_extraction_from_string_content() {
        let body = r#"{"messages": [{"role": "user", "content": "hello"}]}"#;
        let prompt = ChatGpt.extract_prompt(URL, body).unwrap();
        assert_eq!(prompt.text, "hello");
        assert_eq!(prompt.model, None);
    }

    #[test]
    fn stream_appends_until_done() {
        let mut parser = ChatGpt.stream_parser();
        let chunk = concat!(
            "data: {\"v\":{\"message\":{\"metadata\":{\"model_slug\":\"gpt-4o\"},\"content\":{\"parts\":[\"\"]}}}}\n",
            "data: {\"v\":[{\"o\":\"append\",\"p\":\"/message/content/parts/0\",\"v\":\"knock \"}]}\n",
            "data: {\"v\":[{\"o\":\"append\",\"p\":\"/message/content/parts/0\",\"v\":\"knock\"}]}\n",
        );
        assert!(parser.consume_fragment(chunk).is_empty());
        let finished = parser.consume_fragment("data: [DONE]\n");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].model.as_deref(), Some("gpt-4o"));
        // "knock knock" -> 11 bytes -> 3 tokens.
        assert_eq!(finished[0].output_tokens, 3);
    }

    #[test]
    fn lines_split_across_chunks_reassemble() {
        let mut parser = ChatGpt.stream_parser();
        parser.consume_fragment(
            "data: {\"v\":[{\"o\":\"append\",\"p\":\"/message/content/parts/0\",\"v\":\"hi",
        );
        parser.consume_fragment("!\"}]}\n");
        let finished = parser.consume_fragment("data: [DONE]\n");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].output_tokens, 1);
    }

    #[test]
    fn malformed_fragments_are_skipped() {
        let mut parser = ChatGpt.stream_parser();
        parser.consume_fragment("data: not json at all\n");
        parser.consume_fragment(
            "data: {\"v\":[{\"o\":\"append\",\"p\":\"/message/content/parts/0\",\"v\":\"ok\"}]}\n",
        );
        let finished = parser.consume_fragment("data: [DONE]\n");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].output_tokens, 1);
    }

    #[test]
    fn empty_stream_emits_nothing() {
        let mut parser = ChatGpt.stream_parser();
        assert!(parser.consume_fragment("data: [DONE]\n").is_empty());
        assert!(parser.finish().is_none());
    }
}
