//! Credential lookup per provider.
//!
//! Secrets never touch the run config or any persisted file.

use std::collections::HashMap;
use thiserror::Error;

use pricevault_core::domain::ProviderKind;
use pricevault_core::provider::Credentials;

pub const BARCHART_USERNAME_VAR: &str = "PRICEVAULT_BARCHART_USERNAME";
pub const BARCHART_PASSWORD_VAR: &str = "PRICEVAULT_BARCHART_PASSWORD";
pub const GATEWAY_CLIENT_ID_VAR: &str = "PRICEVAULT_GATEWAY_CLIENT_ID";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credentials configured for {provider} (set {hint})")]
    Missing {
        provider: ProviderKind,
        hint: &'static str,
    },

    #[error("invalid credential value in {var}")]
    Invalid { var: &'static str },
}

pub trait CredentialSource: Send + Sync {
    fn credentials(&self, provider: ProviderKind) -> Result<Credentials, CredentialError>;
}

/// Fixed credentials, mainly for tests and embedding.
///
/// Providers without an entry get empty credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<ProviderKind, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: ProviderKind, credentials: Credentials) -> Self {
        self.entries.insert(provider, credentials);
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self, provider: ProviderKind) -> Result<Credentials, CredentialError> {
        Ok(self.entries.get(&provider).cloned().unwrap_or_default())
    }
}

/// Reads credentials from `PRICEVAULT_*` environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    fn lookup(
        provider: ProviderKind,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<Credentials, CredentialError> {
        match provider {
            ProviderKind::Barchart => {
                let username = get(BARCHART_USERNAME_VAR).filter(|s| !s.is_empty());
                let password = get(BARCHART_PASSWORD_VAR).filter(|s| !s.is_empty());
                match (username, password) {
                    (Some(u), Some(p)) => Ok(Credentials::login(&u, &p)),
                    _ => Err(CredentialError::Missing {
                        provider,
                        hint: "PRICEVAULT_BARCHART_USERNAME and PRICEVAULT_BARCHART_PASSWORD",
                    }),
                }
            }
            ProviderKind::Yahoo => Ok(Credentials::none()),
            // Optional: the gateway falls back to the configured client id.
            ProviderKind::Gateway => match get(GATEWAY_CLIENT_ID_VAR) {
                None => Ok(Credentials::none()),
                Some(raw) => raw
                    .trim()
                    .parse::<i32>()
                    .map(Credentials::client)
                    .map_err(|_| CredentialError::Invalid {
                        var: GATEWAY_CLIENT_ID_VAR,
                    }),
            },
        }
    }
}

impl CredentialSource for EnvCredentials {
    fn credentials(&self, provider: ProviderKind) -> Result<Credentials, CredentialError> {
        Self::lookup(provider, |name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn barchart_needs_both_username_and_password() {
        let only_user = [(BARCHART_USERNAME_VAR, "trader")];
        assert!(matches!(
            EnvCredentials::lookup(ProviderKind::Barchart, env(&only_user)),
            Err(CredentialError::Missing { provider: ProviderKind::Barchart, .. })
        ));

        let both = [(BARCHART_USERNAME_VAR, "trader"), (BARCHART_PASSWORD_VAR, "pw")];
        let creds = EnvCredentials::lookup(ProviderKind::Barchart, env(&both)).unwrap();
        assert_eq!(creds, Credentials::login("trader", "pw"));
    }

    #[test]
    fn yahoo_needs_nothing() {
        assert_eq!(
            EnvCredentials::lookup(ProviderKind::Yahoo, env(&[])).unwrap(),
            Credentials::none()
        );
    }

    #[test]
    fn gateway_client_id_is_optional_but_must_parse() {
        assert_eq!(
            EnvCredentials::lookup(ProviderKind::Gateway, env(&[])).unwrap(),
            Credentials::none()
        );
        let set = [(GATEWAY_CLIENT_ID_VAR, " 17 ")];
        assert_eq!(
            EnvCredentials::lookup(ProviderKind::Gateway, env(&set)).unwrap(),
            Credentials::client(17)
        );
        let bad = [(GATEWAY_CLIENT_ID_VAR, "seventeen")];
        assert!(EnvCredentials::lookup(ProviderKind::Gateway, env(&bad)).is_err());
    }

    #[test]
    fn static_credentials_default_to_empty() {
        let source = StaticCredentials::new().with(ProviderKind::Barchart, Credentials::login("u", "p"));
        assert_eq!(
            source.credentials(ProviderKind::Barchart).unwrap(),
            Credentials::login("u", "p")
        );
        assert_eq!(source.credentials(ProviderKind::Gateway).unwrap(), Credentials::none());
    }
}
