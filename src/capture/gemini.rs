//! Gemini adapter, following the streamGenerateContent shape: newline-
//! delimited (optionally SSE-framed) JSON chunks carrying
//! `candidates[0].content.parts[].text` deltas. Completion is signalled
//! by `finishReason` or by the stream ending.

use serde_json::Value;

use super::{
    estimate_tokens, ExtractedPrompt, LineBuffer, ResponseSummary, Site,
    SiteAdapter, StreamParser,
};

fn is_generate_url(url: &str) -> bool {
    let url = url.to_ascii_lowercase();
    url.contains(":streamgeneratecontent") || url.contains(":generatecontent")
}

/// `.../models/<model>:streamGenerateContent...`
fn model_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/models/")?;
    let model = rest.split(':').next()?;
    if model.is_empty() {
        return None;
    }
    Some(model.to_string())
}

pub struct Gemini;

impl SiteAdapter for Gemini {
    fn site(&self) -> Site {
        Site::Gemini
    }

    fn is_prompt_request(&self, url: &str, method: &str) -> bool {
        method.eq_ignore_ascii_case("POST") && is_generate_url(url)
    }

    fn is_stream_response(&self, url: &str) -> bool {
        is_generate_url(url)
    }

    fn extract_prompt(
        &self,
        url: &str,
        body: &str,
    ) -> Option<ExtractedPrompt> {
        let body: Value = serde_json::from_str(body).ok()?;
        let contents = body.get("contents")?.as_array()?;
        let last_user = contents.iter().rev().find(|content| {
            // Single-turn requests may omit the role entirely.
            matches!(
                content.get("role").and_then(Value::as_str),
                Some("user") | None
            )
        })?;
        let parts = last_user.get("parts")?.as_array()?;
        let text = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            return None;
        }
        Some(ExtractedPrompt {
            text,
            model: model_from_url(url),
        })
    }

    fn stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(GeminiStream::default())
    }
}

#[derive(Default)]
pub struct GeminiStream {
    lines: LineBuffer,
    text: String,
    model: Option<String>,
}

impl GeminiStream {
    fn consume_record(&mut self, value: &Value) -> bool {
        if let Some(model) =
            value.get("modelVersion").and_then(Value::as_str)
        {
            self.model = Some(model.to_string());
        }
        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str)
                {
                    self.text.push_str(text);
                }
            }
        }
        value
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .is_some()
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

impl StreamParser for GeminiStream {
    fn consume_fragment(&mut self, raw: &str) -> Vec<ResponseSummary> {
        let mut finished = Vec::new();
        for line in self.lines.push(raw) {
            let trimmed = line.trim();
            // Both bare NDJSON and SSE framing occur in the wild.
            let data = trimmed.strip_prefix("data:").unwrap_or(trimmed);
            let data = data.trim().trim_start_matches(',');
            if data.is_empty() || data == "[" || data == "]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(data) else {
                // Non-JSON fragments are expected; skip and keep going.
                continue;
            };
            if self.consume_record(&value) {
                finished.extend(self.take_turn());
            }
        }
        finished
    }

    fn finish(&mut self) -> Option<ResponseSummary> {
        // End-of-stream doubles as the completion sentinel here.
        self.take_turn()
    }
}

#[cfg(test)]
mod tests {
    use super::{Gemini, SiteAdapter};

    const URL: &str = "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:streamGenerateContent?alt=sse";

    #[test]
    fn prompt_request_matching() {
        assert!(Gemini.is_prompt_request(URL, "POST"));
        assert!(!Gemini.is_prompt_request(URL, "GET"));
        assert!(!Gemini.is_prompt_request(
            "https://generativelanguage.googleapis.com/v1beta/models",
            "POST",
        ));
        assert!(Gemini.is_stream_response(URL));
    }

    #[test]
    fn prompt_extraction_with_model_from_url() {
        let body = r#"{"contents": [
            {"role": "user", "parts": [{"text": "compare"}, {"text": "heat pumps"}]}
        ]}"#;
        let prompt = Gemini.extract_prompt(URL, body).unwrap();
        assert_eq!(prompt.text, "compare heat pumps");
        assert_eq!(prompt.model.as_deref(), Some("gemini-1.5-flash"));
    }

    #[test]
    fn finish_reason_completes_the_turn() {
        let mut parser = Gemini.stream_parser();
        let chunk = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Answer \"}]}}],\"modelVersion\":\"gemini-1.5-flash\"}\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"here.\"}]},\"finishReason\":\"STOP\"}]}\n",
        );
        let finished = parser.consume_fragment(chunk);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].model.as_deref(), Some("gemini-1.5-flash"));
        // "Answer here." -> 12 bytes -> 3 tokens.
        assert_eq!(finished[0].output_tokens, 3);
    }

    #[test]
    fn end_of_stream_flushes_accumulated_turn() {
        let mut parser = Gemini.stream_parser();
        parser.consume_fragment(
            "{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"partial\"}]}}]}\n",
        );
        let flushed = parser.finish().unwrap();
        assert_eq!(flushed.output_tokens, 2);
        assert!(parser.finish().is_none());
    }

    #[test]
    fn malformed_chunk_does_not_abort_the_turn() {
        let mut parser = Gemini.stream_parser();
        parser.consume_fragment("data: {{{\n");
        let finished = parser.consume_fragment(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]},\"finishReason\":\"STOP\"}]}\n",
        );
        assert_eq!(finished.len(), 1);
        assert!(parser.finish().is_none());
    }
}
