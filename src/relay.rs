//! The privileged delivery context: an NDJSON stdio message loop that
//! holds the stored credential, keeps local counters, runs capture over
//! raw intercepted traffic, and forwards ingestion events to the
//! aggregation service through the delivery queue.
//!
//! One JSON message per line on stdin; replies and STATS_UPDATED pushes
//! go to stdout the same way.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

use crate::{
    capture::{CaptureEvent, Interceptor, Site},
    conf, estimate,
    queue::{DeliveryQueue, Sink},
};

/// Page-context <-> privileged-context protocol. Closed set: adding a
/// message type is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "STORE_TOKEN")]
    StoreToken { token: String },
    #[serde(rename = "PROMPT_SENT")]
    PromptSent {
        model: String,
        #[serde(rename = "inputTokens", default)]
        input_tokens: u64,
    },
    #[serde(rename = "RESPONSE_TOKENS")]
    ResponseTokens {
        model: String,
        #[serde(default)]
        tokens: u64,
    },
    #[serde(rename = "GET_STATS")]
    GetStats,
    #[serde(rename = "RESET_STATS")]
    ResetStats,
    #[serde(rename = "LOGOUT")]
    Logout,
    /// Raw outgoing request, forwarded verbatim by the page shim so the
    /// format-sensitive parsing stays here.
    #[serde(rename = "RAW_REQUEST")]
    RawRequest {
        site: Site,
        url: String,
        method: String,
        body: String,
    },
    #[serde(rename = "RAW_STREAM_CHUNK")]
    RawStreamChunk {
        stream: u64,
        site: Site,
        data: String,
    },
    #[serde(rename = "RAW_STREAM_DONE")]
    RawStreamDone { stream: u64 },
    /// Outbound push to any listening display surface.
    #[serde(rename = "STATS_UPDATED")]
    StatsUpdated { stats: StatsState },
}

/// Local counters mirrored to every display surface. Explicit state,
/// loaded at startup and saved on every mutation.
#[derive(
    Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct StatsState {
    pub prompt_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_co2_grams: f64,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct RelayState {
    stats: StatsState,
    token: Option<String>,
}

impl RelayState {
    fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|error| {
                tracing::warn!(%error, ?path, "Unreadable relay state. Starting fresh.");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(format!(
                "Failed to create parent directory \
                for relay state file: {path:?}"
            ))?;
        }
        let s = serde_json::to_string_pretty(self)?;
        std::fs::write(path, s)?;
        Ok(())
    }
}

/// Event bound for the aggregation service.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Prompt {
        site: Site,
        input_tokens: u64,
        co2_grams: f64,
    },
    Response {
        site: Site,
        output_tokens: u64,
        co2_grams: f64,
    },
}

/// Pre-parsed page events carry model slugs, while the service accepts
/// only the site enumeration. Map slugs onto their site.
#[must_use]
pub fn site_for_model(model: &str) -> Site {
    let model = model.to_ascii_lowercase();
    if model.contains("claude")
        || model.contains("haiku")
        || model.contains("sonnet")
        || model.contains("opus")
    {
        Site::Claude
    } else if model.contains("gemini") || model.contains("bard") {
        Site::Gemini
    } else {
        Site::ChatGpt
    }
}

/// Posts ingestion events to the aggregation service. A missing stored
/// credential is a delivery failure: the event stays queued until login.
pub struct Backend {
    http: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
}

impl Backend {
    #[must_use]
    pub fn new(
        base_url: String,
        token: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token,
        }
    }
}

impl Sink<Outbound> for Backend {
    async fn deliver(&mut self, event: &Outbound) -> anyhow::Result<()> {
        let token = self
            .token
            .read()
            .map_err(|_| anyhow::anyhow!("token lock poisoned"))?
            .clone()
            .context("no stored credential")?;
        let (path, body) = match event {
            Outbound::Prompt {
                site,
                input_tokens,
                co2_grams,
            } => (
                "/api/prompt",
                serde_json::json!({
                    "model": site.as_str(),
                    "inputTokens": input_tokens,
                    "co2": co2_grams,
                }),
            ),
            Outbound::Response {
                site,
                output_tokens,
                co2_grams,
            } => (
                "/api/response",
                serde_json::json!({
                    "model": site.as_str(),
                    "outputTokens": output_tokens,
                    "co2": co2_grams,
                }),
            ),
        };
        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            // Validation failures don't get better with retries.
            tracing::error!(%url, "Event rejected as invalid. Dropping.");
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }
}

/// Message dispatcher. Owns the local state and the capture
/// interceptor; enqueues outbound events on `events`.
pub struct Relay {
    state: RelayState,
    state_path: PathBuf,
    interceptor: Interceptor,
    token: Arc<RwLock<Option<String>>>,
    events: mpsc::UnboundedSender<Outbound>,
}

impl Relay {
    #[must_use]
    pub fn new(
        state_path: PathBuf,
        token: Arc<RwLock<Option<String>>>,
        events: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let state = RelayState::load(&state_path);
        if let Ok(mut slot) = token.write() {
            slot.clone_from(&state.token);
        }
        Self {
            state,
            state_path,
            interceptor: Interceptor::new(),
            token,
            events,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &StatsState {
        &self.state.stats
    }

    pub fn handle(&mut self, msg: Message) -> Vec<Message> {
        match msg {
            Message::StoreToken { token } => {
                self.state.token = Some(token);
                if let Ok(mut slot) = self.token.write() {
                    slot.clone_from(&self.state.token);
                }
                self.persist();
                Vec::new()
            }
            Message::PromptSent {
                model,
                input_tokens,
            } => self.ingest(CaptureEvent::Prompt(
                crate::capture::PromptCapture {
                    site: site_for_model(&model),
                    model,
                    input_tokens,
                },
            )),
            Message::ResponseTokens { model, tokens } => {
                let co2_grams = estimate::grams(&model, tokens);
                self.ingest(CaptureEvent::Response(
                    crate::capture::ResponseCapture {
                        site: site_for_model(&model),
                        model,
                        output_tokens: tokens,
                        co2_grams,
                    },
                ))
            }
            Message::GetStats => vec![self.stats_updated()],
            Message::ResetStats => {
                self.state.stats = StatsState::default();
                self.persist();
                vec![self.stats_updated()]
            }
            Message::Logout => {
                self.state.token = None;
                if let Ok(mut slot) = self.token.write() {
                    *slot = None;
                }
                self.persist();
                Vec::new()
            }
            Message::RawRequest {
                site,
                url,
                method,
                body,
            } => {
                match self
                    .interceptor
                    .on_request(site, &url, &method, &body)
                {
                    Some(event) => self.ingest(event),
                    None => Vec::new(),
                }
            }
            Message::RawStreamChunk { stream, site, data } => {
                let events =
                    self.interceptor.on_stream_chunk(stream, site, &data);
                events
                    .into_iter()
                    .flat_map(|event| self.ingest(event))
                    .collect()
            }
            Message::RawStreamDone { stream } => {
                match self.interceptor.on_stream_done(stream) {
                    Some(event) => self.ingest(event),
                    None => Vec::new(),
                }
            }
            // Outbound-only; tolerated on input.
            Message::StatsUpdated { .. } => Vec::new(),
        }
    }

    fn ingest(&mut self, event: CaptureEvent) -> Vec<Message> {
        let outbound = match event {
            CaptureEvent::Prompt(prompt) => {
                self.state.stats.prompt_count += 1;
                self.state.stats.total_input_tokens += prompt.input_tokens;
                Outbound::Prompt {
                    site: prompt.site,
                    input_tokens: prompt.input_tokens,
                    co2_grams: 0.0,
                }
            }
            CaptureEvent::Response(response) => {
                self.state.stats.total_output_tokens +=
                    response.output_tokens;
                self.state.stats.total_co2_grams += response.co2_grams;
                Outbound::Response {
                    site: response.site,
                    output_tokens: response.output_tokens,
                    co2_grams: response.co2_grams,
                }
            }
        };
        self.persist();
        if self.events.send(outbound).is_err() {
            tracing::warn!("Delivery queue is gone. Event kept locally only.");
        }
        vec![self.stats_updated()]
    }

    fn stats_updated(&self) -> Message {
        Message::StatsUpdated {
            stats: self.state.stats.clone(),
        }
    }

    fn persist(&self) {
        if let Err(error) = self.state.save(&self.state_path) {
            tracing::error!(%error, "Failed to save relay state.");
        }
    }
}

#[tracing::instrument(name = "relay", skip_all)]
pub async fn run() -> anyhow::Result<()> {
    let conf = conf::global();
    let token = Arc::new(RwLock::new(None));
    let (tx, rx) = mpsc::unbounded_channel();
    let backend =
        Backend::new(conf.relay.backend_url.clone(), Arc::clone(&token));
    let queue = DeliveryQueue::new(
        backend,
        Duration::from_secs_f32(conf.relay.send_interval),
        conf.relay.max_attempts,
    );
    let queue_task = tokio::spawn(queue.run(rx));

    let mut relay =
        Relay::new(PathBuf::from("data/relay_state.json"), token, tx);
    tracing::info!(backend_url = %conf.relay.backend_url, "Relay started.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Message = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "Unparseable message. Skipping.");
                continue;
            }
        };
        for reply in relay.handle(msg) {
            let mut out = serde_json::to_vec(&reply)?;
            out.push(b'\n');
            stdout.write_all(&out).await?;
        }
        stdout.flush().await?;
    }

    // Stdin closed: let the queue finish what it can.
    drop(relay);
    queue_task.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use tokio::sync::mpsc;

    use super::{site_for_model, Message, Outbound, Relay, StatsState};
    use crate::capture::Site;

    fn relay_in(
        dir: &tempfile::TempDir,
    ) -> (Relay, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Relay::new(
            dir.path().join("relay_state.json"),
            Arc::new(RwLock::new(None)),
            tx,
        );
        (relay, rx)
    }

    #[test]
    fn tags_round_trip() {
        let msg: Message = serde_json::from_str(
            r#"{"type":"PROMPT_SENT","model":"gpt-4o","inputTokens":12}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::PromptSent {
                model: "gpt-4o".to_string(),
                input_tokens: 12,
            }
        );

        let out = serde_json::to_value(Message::StatsUpdated {
            stats: StatsState::default(),
        })
        .unwrap();
        assert_eq!(out["type"], "STATS_UPDATED");
        assert_eq!(out["stats"]["promptCount"], 0);
    }

    #[test]
    fn model_slugs_map_to_sites() {
        assert_eq!(site_for_model("claude-3-haiku"), Site::Claude);
        assert_eq!(site_for_model("Sonnet 4.5"), Site::Claude);
        assert_eq!(site_for_model("gemini-1.5-pro"), Site::Gemini);
        assert_eq!(site_for_model("gpt-4o"), Site::ChatGpt);
        assert_eq!(site_for_model("unknown"), Site::ChatGpt);
    }

    #[test]
    fn prompt_updates_stats_and_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let (mut relay, mut rx) = relay_in(&dir);
        let replies = relay.handle(Message::PromptSent {
            model: "gpt-4o".to_string(),
            input_tokens: 12,
        });
        assert_eq!(relay.stats().prompt_count, 1);
        assert_eq!(relay.stats().total_input_tokens, 12);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], Message::StatsUpdated { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Prompt {
                site: Site::ChatGpt,
                input_tokens: 12,
                co2_grams: 0.0,
            }
        );
    }

    #[test]
    fn response_gets_a_co2_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut relay, mut rx) = relay_in(&dir);
        relay.handle(Message::ResponseTokens {
            model: "claude-3-haiku".to_string(),
            tokens: 1000,
        });
        assert_eq!(relay.stats().total_output_tokens, 1000);
        assert!(relay.stats().total_co2_grams > 0.0);
        let Outbound::Response {
            site, co2_grams, ..
        } = rx.try_recv().unwrap()
        else {
            panic!("expected a response event");
        };
        assert_eq!(site, Site::Claude);
        assert!((co2_grams - 0.103_612_536).abs() < 1e-9);
    }

    #[test]
    fn raw_capture_flows_through() {
        let dir = tempfile::tempdir().unwrap();
        let (mut relay, mut rx) = relay_in(&dir);
        relay.handle(Message::RawRequest {
            site: Site::Claude,
            url: "https://claude.ai/api/organizations/o/chat_conversations/c/completion"
                .to_string(),
            method: "POST".to_string(),
            body: r#"{"prompt": "hello there"}"#.to_string(),
        });
        assert_eq!(relay.stats().prompt_count, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Prompt {
                site: Site::Claude,
                ..
            }
        ));

        relay.handle(Message::RawStreamChunk {
            stream: 1,
            site: Site::Claude,
            data: concat!(
                "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi!\"}}\n",
                "data: {\"type\":\"message_stop\"}\n",
            )
            .to_string(),
        });
        assert_eq!(relay.stats().total_output_tokens, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Response { .. }
        ));
        assert!(relay
            .handle(Message::RawStreamDone { stream: 1 })
            .is_empty());
    }

    #[test]
    fn reset_zeroes_and_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut relay, _rx) = relay_in(&dir);
        relay.handle(Message::PromptSent {
            model: "gpt-4o".to_string(),
            input_tokens: 4,
        });
        relay.handle(Message::StoreToken {
            token: "tok-1".to_string(),
        });

        // A fresh relay over the same directory sees the saved state.
        let (relay2, _rx2) = relay_in(&dir);
        assert_eq!(relay2.stats().prompt_count, 1);

        let replies = relay.handle(Message::ResetStats);
        assert_eq!(relay.stats(), &StatsState::default());
        assert_eq!(replies.len(), 1);
    }
}
