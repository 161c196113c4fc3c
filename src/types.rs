use std::collections::BTreeMap;

use utoipa::ToSchema;

/// Per-model counter slice, used both for lifetime totals and for one
/// day's breakdown.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ModelSlice {
    pub prompts: u64,
    pub output_tokens: u64,
    pub co2: f64,
}

#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub username: Option<String>,
    pub prompt_total: u64,
    pub output_tokens: u64,
    pub co2_total: f64,
    /// 0 means no limit.
    pub daily_limit_prompts: u64,
    /// 0 means no limit.
    pub daily_limit_co2: f64,
    pub model_totals: BTreeMap<String, ModelSlice>,
}

#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct DaySnapshot {
    pub prompt_count: u64,
    pub output_tokens: u64,
    pub co2_total: f64,
    pub model_breakdown: BTreeMap<String, ModelSlice>,
}

/// One row of `/api/history/year`.
#[derive(
    Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    /// UTC calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub prompt_count: u64,
    pub output_tokens: u64,
    pub co2_total: f64,
}

#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    ToSchema,
)]
pub struct Exceeded {
    /// Absent on response-recording, which cannot add prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<bool>,
    pub co2: bool,
}

#[derive(
    Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub uid: String,
    pub username: Option<String>,
    pub prompt_total: u64,
    pub co2_total: f64,
}

fn default_model() -> String {
    "chatgpt".to_string()
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptBody {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub co2: f64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub co2: f64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenBody {
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct RecordResponse {
    pub success: bool,
    pub exceeded: Exceeded,
    pub user: UserSnapshot,
    pub today: DaySnapshot,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct StatsResponse {
    pub success: bool,
    pub user: UserSnapshot,
    pub today: DaySnapshot,
    pub exceeded: Exceeded,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct LeaderboardResponse {
    pub success: bool,
    pub data: Vec<LeaderboardRow>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct HistoryResponse {
    pub success: bool,
    pub history: Vec<DayRecord>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeUser {
    pub uid: String,
    pub email: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct TokenResponse {
    pub success: bool,
    pub token: String,
    pub user: BridgeUser,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct Health {
    pub ok: bool,
}
