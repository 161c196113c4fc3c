use std::time::{Duration, SystemTime, SystemTimeError, UNIX_EPOCH};

use crate::conf::ConfJwt;

use super::jwt;

/// The only token type the aggregation endpoints accept.
pub const TOKEN_TYPE_EXTENSION: &str = "extension";

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub token_type: String,
    pub aud: String,
    pub iss: String,
    exp: u64,
}

impl Claims {
    /// Long-lived extension credential for `sub`, minted by the
    /// credential bridge after the identity provider vouched for the
    /// caller.
    pub fn extension(
        sub: &str,
        email: Option<&str>,
        ttl: Duration,
        jwt_conf: &ConfJwt,
    ) -> Result<Self, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let exp = now.saturating_add(ttl).as_secs();
        Ok(Self {
            sub: sub.to_string(),
            email: email.map(str::to_string),
            token_type: TOKEN_TYPE_EXTENSION.to_string(),
            aud: jwt_conf.audience.clone(),
            iss: jwt_conf.issuer.clone(),
            exp,
        })
    }

    #[must_use]
    pub fn is_extension(&self) -> bool {
        self.token_type == TOKEN_TYPE_EXTENSION
    }

    pub fn to_str(&self, jwt_conf: &ConfJwt) -> jwt::Result<String> {
        jwt::encode(self, jwt_conf)
    }

    pub fn from_str(str: &str, jwt_conf: &ConfJwt) -> jwt::Result<Self> {
        jwt::decode::<Self>(str, jwt_conf)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonwebtoken::errors::ErrorKind;

    use crate::conf::ConfJwt;

    use super::Claims;

    fn claims(conf: &ConfJwt) -> Claims {
        Claims::extension(
            "foo",
            Some("foo@example.com"),
            Duration::from_secs(5),
            conf,
        )
        .unwrap()
    }

    #[test]
    fn good() {
        let conf = ConfJwt::default();
        let claims = claims(&conf);
        let encoded: String = claims.to_str(&conf).unwrap();
        let decoded = Claims::from_str(&encoded, &conf).unwrap();
        assert_eq!(&claims, &decoded);
        assert!(decoded.is_extension());
    }

    #[test]
    fn bad_key() {
        let conf_good = ConfJwt::default();
        let conf_bad = ConfJwt {
            secret: conf_good.secret.to_string() + "naughty",
            ..conf_good.clone()
        };

        let encoded: String = claims(&conf_good).to_str(&conf_good).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf_bad);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_audience() {
        let conf_good = ConfJwt::default();
        let conf_bad = ConfJwt {
            audience: "somebody-else".to_string(),
            ..conf_good.clone()
        };

        let encoded: String = claims(&conf_good).to_str(&conf_good).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf_bad);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::InvalidAudience)
        ));
    }

    #[test]
    fn expired() {
        let conf = ConfJwt {
            secret: "super secret".to_string(),
            ..Default::default()
        };

        let mut claims = claims(&conf);
        claims.exp = 10; // Expire arbitrarily-far back in the past.

        let encoded: String = claims.to_str(&conf).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::ExpiredSignature)
        ));
    }

    #[test]
    fn non_extension_token_is_detectable() {
        let conf = ConfJwt::default();
        let mut claims = claims(&conf);
        claims.token_type = "session".to_string();
        assert!(!claims.is_extension());
    }
}
