//! Best-effort capture of prompt/response traffic on supported chat
//! sites. Wire formats here are undocumented third-party shapes and WILL
//! drift; each site adapter is replaceable in isolation.

use std::collections::HashMap;

use crate::estimate;

pub mod chatgpt;
pub mod claude;
pub mod gemini;

/// Supported chat sites. This is also the closed model enumeration the
/// aggregation service accepts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    ChatGpt,
    Claude,
    Gemini,
}

impl Site {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatGpt => "chatgpt",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }
}

impl std::str::FromStr for Site {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chatgpt" => Ok(Self::ChatGpt),
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            other => Err(crate::error::Error::InvalidModel(other.to_string())),
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristic token estimate: whitespace runs collapse to single spaces,
/// ends trimmed, one token per 4 bytes of what remains, rounded up.
/// Stable for identical normalized text; no claim of matching any real
/// tokenizer.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.len().div_ceil(4) as u64
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptCapture {
    pub site: Site,
    pub model: String,
    pub input_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseCapture {
    pub site: Site,
    pub model: String,
    pub output_tokens: u64,
    pub co2_grams: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Prompt(PromptCapture),
    Response(ResponseCapture),
}

/// One finished assistant turn, as accumulated by a stream parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub model: Option<String>,
    pub output_tokens: u64,
}

/// Prompt text and model pulled out of an outgoing request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPrompt {
    pub text: String,
    pub model: Option<String>,
}

/// Incremental parser over one streamed response body.
///
/// `consume_fragment` never fails: fragments that are not JSON or not
/// the expected shape are skipped and accumulation continues.
pub trait StreamParser: Send {
    /// Consume the next raw chunk; returns a summary for every assistant
    /// turn whose completion sentinel appeared in it.
    fn consume_fragment(&mut self, raw: &str) -> Vec<ResponseSummary>;

    /// End of stream. Adapters whose completion sentinel is the stream
    /// end itself flush the accumulated turn here.
    fn finish(&mut self) -> Option<ResponseSummary>;
}

pub trait SiteAdapter: Send + Sync {
    fn site(&self) -> Site;

    /// Does this outgoing request carry a user prompt?
    fn is_prompt_request(&self, url: &str, method: &str) -> bool;

    /// Does this URL stream an assistant response?
    fn is_stream_response(&self, url: &str) -> bool;

    fn extract_prompt(&self, url: &str, body: &str) -> Option<ExtractedPrompt>;

    fn stream_parser(&self) -> Box<dyn StreamParser>;
}

#[must_use]
pub fn adapter_for(site: Site) -> &'static dyn SiteAdapter {
    match site {
        Site::ChatGpt => &chatgpt::ChatGpt,
        Site::Claude => &claude::Claude,
        Site::Gemini => &gemini::Gemini,
    }
}

/// Accumulates partial lines across stream chunks; chunk boundaries do
/// not align with record boundaries.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, raw: &str) -> Vec<String> {
        self.partial.push_str(raw);
        let mut lines: Vec<String> =
            self.partial.split('\n').map(str::to_string).collect();
        self.partial = lines.pop().unwrap_or_default();
        lines
    }
}

/// Turns raw intercepted traffic into capture events, holding per-stream
/// parser state. Stream ids are assigned by the caller (one per response
/// body being read).
#[derive(Default)]
pub struct Interceptor {
    streams: HashMap<u64, (Site, Box<dyn StreamParser>)>,
}

impl Interceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(
        &mut self,
        site: Site,
        url: &str,
        method: &str,
        body: &str,
    ) -> Option<CaptureEvent> {
        let adapter = adapter_for(site);
        if !adapter.is_prompt_request(url, method) {
            return None;
        }
        let prompt = adapter.extract_prompt(url, body)?;
        let input_tokens = estimate_tokens(&prompt.text);
        if input_tokens == 0 {
            return None;
        }
        let model =
            prompt.model.unwrap_or_else(|| site.as_str().to_string());
        tracing::debug!(%site, %model, input_tokens, "Prompt captured.");
        Some(CaptureEvent::Prompt(PromptCapture {
            site,
            model,
            input_tokens,
        }))
    }

    pub fn on_stream_chunk(
        &mut self,
        stream: u64,
        site: Site,
        data: &str,
    ) -> Vec<CaptureEvent> {
        let (_, parser) = self
            .streams
            .entry(stream)
            .or_insert_with(|| (site, adapter_for(site).stream_parser()));
        parser
            .consume_fragment(data)
            .into_iter()
            .map(|summary| response_event(site, summary))
            .collect()
    }

    pub fn on_stream_done(&mut self, stream: u64) -> Option<CaptureEvent> {
        let (site, mut parser) = self.streams.remove(&stream)?;
        parser.finish().map(|summary| response_event(site, summary))
    }
}

fn response_event(site: Site, summary: ResponseSummary) -> CaptureEvent {
    let model =
        summary.model.unwrap_or_else(|| site.as_str().to_string());
    let co2_grams = estimate::grams(&model, summary.output_tokens);
    tracing::debug!(
        %site,
        %model,
        output_tokens = summary.output_tokens,
        co2_grams,
        "Response captured."
    );
    CaptureEvent::Response(ResponseCapture {
        site,
        model,
        output_tokens: summary.output_tokens,
        co2_grams,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        estimate_tokens, CaptureEvent, Interceptor, LineBuffer, Site,
    };

    #[test]
    fn four_hundred_normalized_chars_is_one_hundred_tokens() {
        let text = "x".repeat(400);
        assert_eq!(estimate_tokens(&text), 100);
    }

    #[test]
    fn whitespace_runs_collapse_before_counting() {
        assert_eq!(
            estimate_tokens("  a   b \n\n c  "),
            estimate_tokens("a b c"),
        );
    }

    #[test]
    fn counts_round_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn site_tags_round_trip() {
        for site in [Site::ChatGpt, Site::Claude, Site::Gemini] {
            let parsed: Site = site.as_str().parse().unwrap();
            assert_eq!(parsed, site);
        }
        assert!("gpt-4".parse::<Site>().is_err());
    }

    #[test]
    fn line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push("data: {\"a\":"), Vec::<String>::new());
        assert_eq!(buf.push("1}\ndata: "), vec!["data: {\"a\":1}"]);
        assert_eq!(buf.push("[DONE]\n"), vec!["data: [DONE]"]);
    }

    #[test]
    fn interceptor_prompt_through_response() {
        let mut interceptor = Interceptor::new();
        let prompt = interceptor
            .on_request(
                Site::Claude,
                "https://claude.ai/api/organizations/abc/chat_conversations/def/completion",
                "POST",
                r#"{"prompt": "how do heat pumps work?"}"#,
            )
            .unwrap();
        let CaptureEvent::Prompt(prompt) = prompt else {
            panic!("expected a prompt event");
        };
        assert_eq!(prompt.site, Site::Claude);
        assert!(prompt.input_tokens > 0);

        let events = interceptor.on_stream_chunk(
            7,
            Site::Claude,
            concat!(
                "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-haiku\"}}\n",
                "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Compressors.\"}}\n",
                "data: {\"type\":\"message_stop\"}\n",
            ),
        );
        assert_eq!(events.len(), 1);
        let CaptureEvent::Response(response) = &events[0] else {
            panic!("expected a response event");
        };
        assert_eq!(response.model, "claude-3-haiku");
        assert_eq!(response.output_tokens, 3);
        assert!(response.co2_grams > 0.0);
        assert!(interceptor.on_stream_done(7).is_none());
    }

    #[test]
    fn unknown_stream_done_is_quiet() {
        let mut interceptor = Interceptor::new();
        assert!(interceptor.on_stream_done(99).is_none());
    }
}
