use utoipa::openapi::security::HttpAuthScheme;
use utoipa::OpenApi;

use crate::capture::Site;
use crate::types::{
    BridgeUser, DayRecord, DaySnapshot, Exceeded, Health, HistoryResponse,
    LeaderboardResponse, LeaderboardRow, ModelSlice, PromptBody,
    RecordResponse, ResponseBody, StatsResponse, TokenBody, TokenResponse,
    UserSnapshot,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::health_handler,
        crate::server::prompt_handler,
        crate::server::response_handler,
        crate::server::stats_handler,
        crate::server::history_year_handler,
        crate::server::leaderboard_handler,
        crate::server::extension_token_handler,
    ),
    components(
        schemas(
            Site,
            Health,
            ModelSlice,
            UserSnapshot,
            DaySnapshot,
            DayRecord,
            Exceeded,
            LeaderboardRow,
            PromptBody,
            ResponseBody,
            TokenBody,
            RecordResponse,
            StatsResponse,
            LeaderboardResponse,
            HistoryResponse,
            BridgeUser,
            TokenResponse
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "co2ounter", description = "Usage ingestion and aggregation endpoints")
    ),
    info(
        title = "CO2ounter API",
        version = "1.0",
        description = "Aggregates per-user AI-chat usage and carbon estimates",
        license(name = "BSD-3-Clause")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
