//! Identity-provider client. The provider itself is an external
//! collaborator: it verifies passwords and issues short-lived ID tokens
//! which we only ever look up, never mint.

use crate::{
    conf::ConfIdp,
    error::{Error, Result},
};

#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Clone)]
pub struct Idp {
    http: reqwest::Client,
    conf: ConfIdp,
}

#[derive(serde::Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl Idp {
    #[must_use]
    pub fn new(conf: ConfIdp) -> Self {
        Self {
            http: reqwest::Client::new(),
            conf,
        }
    }

    /// Resolves a short-lived provider ID token to the identity it was
    /// issued for. Any provider-side rejection is an auth failure, not a
    /// server fault.
    pub async fn verify_id_token(&self, id_token: &str) -> Result<Identity> {
        let url = format!(
            "{}/v1/accounts:lookup?key={}",
            self.conf.base_url.trim_end_matches('/'),
            self.conf.api_key,
        );
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "idToken": id_token }))
            .send()
            .await?;
        if !resp.status().is_success() {
            tracing::warn!(status = ?resp.status(), "ID token lookup rejected.");
            return Err(Error::Unauthorized);
        }
        let body: LookupResponse = resp.json().await?;
        body.users
            .into_iter()
            .next()
            .map(|user| Identity {
                uid: user.local_id,
                email: user.email,
                display_name: user.display_name,
            })
            .ok_or(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::LookupResponse;

    #[test]
    fn lookup_response_shape() {
        let json = r#"{
            "kind": "identitytoolkit#GetAccountInfoResponse",
            "users": [{
                "localId": "u-123",
                "email": "u@example.com",
                "displayName": "U",
                "emailVerified": true
            }]
        }"#;
        let parsed: LookupResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.users.len(), 1);
        assert_eq!(parsed.users[0].local_id, "u-123");
        assert_eq!(parsed.users[0].email.as_deref(), Some("u@example.com"));
    }

    #[test]
    fn empty_user_list_parses() {
        let parsed: LookupResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.users.is_empty());
    }
}
