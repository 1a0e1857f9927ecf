//! Credential applier: turns an `AuthConfig` into header/query mutations a transport
//! can apply to its own request representation (reqwest builder, tungstenite request,
//! tonic metadata, ...) without each transport re-implementing the same match arms.
use crate::auth::AuthConfig;
use crate::errors::UtcpError;
use base64::Engine;

/// Where a credential value should be placed on the outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialLocation {
    Header,
    Query,
    Cookie,
}

impl CredentialLocation {
    fn parse(location: &str) -> Result<Self, UtcpError> {
        match location.to_ascii_lowercase().as_str() {
            "header" => Ok(Self::Header),
            "query" => Ok(Self::Query),
            "cookie" => Ok(Self::Cookie),
            other => Err(UtcpError::Authentication(format!(
                "unsupported credential location: {other}"
            ))),
        }
    }
}

/// A fully-resolved credential, ready for a transport to splice into its own request
/// builder. At most one of `header`/`query` is populated per variant of `AuthConfig`.
#[derive(Debug, Clone)]
pub struct AppliedCredential {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl AppliedCredential {
    fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            headers: vec![(name.into(), value.into())],
            query: Vec::new(),
        }
    }

    fn query(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            headers: Vec::new(),
            query: vec![(name.into(), value.into())],
        }
    }
}

/// Resolve an `AuthConfig` into headers/query parameters to apply to an outbound
/// request. OAuth2 is only supported in its pre-fetched bearer-token form (`spec.md`
/// scopes OAuth2 to `{access-token}` — no token exchange flow is in scope).
pub fn apply_credentials(auth: &AuthConfig) -> Result<AppliedCredential, UtcpError> {
    match auth {
        AuthConfig::ApiKey(api_key) => {
            let location = CredentialLocation::parse(&api_key.location)?;
            Ok(match location {
                CredentialLocation::Header => {
                    AppliedCredential::header(&api_key.var_name, &api_key.api_key)
                }
                CredentialLocation::Query => {
                    AppliedCredential::query(&api_key.var_name, &api_key.api_key)
                }
                CredentialLocation::Cookie => AppliedCredential::header(
                    "cookie",
                    format!("{}={}", api_key.var_name, api_key.api_key),
                ),
            })
        }
        AuthConfig::Basic(basic) => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", basic.username, basic.password));
            Ok(AppliedCredential::header(
                "authorization",
                format!("Basic {encoded}"),
            ))
        }
        AuthConfig::OAuth2(oauth) => Ok(AppliedCredential::header(
            "authorization",
            format!("Bearer {}", oauth.access_token),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, AuthType, BasicAuth, OAuth2Auth};

    #[test]
    fn api_key_header_location() {
        let auth = AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "secret".into(),
            var_name: "X-Key".into(),
            location: "header".into(),
        });
        let applied = apply_credentials(&auth).unwrap();
        assert_eq!(applied.headers, vec![("X-Key".to_string(), "secret".to_string())]);
        assert!(applied.query.is_empty());
    }

    #[test]
    fn api_key_query_location() {
        let auth = AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "secret".into(),
            var_name: "key".into(),
            location: "query".into(),
        });
        let applied = apply_credentials(&auth).unwrap();
        assert_eq!(applied.query, vec![("key".to_string(), "secret".to_string())]);
    }

    #[test]
    fn basic_auth_encodes_header() {
        let auth = AuthConfig::Basic(BasicAuth {
            auth_type: AuthType::Basic,
            username: "user".into(),
            password: "pass".into(),
        });
        let applied = apply_credentials(&auth).unwrap();
        assert_eq!(
            applied.headers,
            vec![("authorization".to_string(), "Basic dXNlcjpwYXNz".to_string())]
        );
    }

    #[test]
    fn oauth2_bearer_header() {
        let auth = AuthConfig::OAuth2(OAuth2Auth {
            auth_type: AuthType::OAuth2,
            access_token: "tok123".into(),
        });
        let applied = apply_credentials(&auth).unwrap();
        assert_eq!(
            applied.headers,
            vec![("authorization".to_string(), "Bearer tok123".to_string())]
        );
    }

    #[test]
    fn unsupported_location_is_rejected() {
        let auth = AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "secret".into(),
            var_name: "X-Key".into(),
            location: "fragment".into(),
        });
        assert!(apply_credentials(&auth).is_err());
    }
}
