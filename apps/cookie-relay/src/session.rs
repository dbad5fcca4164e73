use std::fmt;

use uuid::Uuid;

/// Generate a new refresh token.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Generate the id that ties a waiting page to its live channel.
pub fn generate_live_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Account credentials typed into the operator form.
#[derive(Clone)]
pub struct AccountCredentials {
    pub account_id: String,
    pub secret: String,
}

impl AccountCredentials {
    pub fn new(account_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            secret: secret.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.account_id.trim().is_empty() && !self.secret.is_empty()
    }
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("account_id", &self.account_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Sign-in site and the language its pages should be served in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSite {
    pub host: String,
    pub locale: String,
}

impl TargetSite {
    pub const DEFAULT_HOST: &'static str = "alexa.amazon.com";
    pub const DEFAULT_LOCALE: &'static str = "en-US";

    /// Parse the form value `host|locale`. Missing halves fall back to the US site.
    pub fn parse(raw: &str) -> Self {
        let (host, locale) = match raw.split_once('|') {
            Some((host, locale)) => (host.trim(), locale.trim()),
            None => (raw.trim(), ""),
        };
        Self {
            host: if host.is_empty() {
                Self::DEFAULT_HOST.to_string()
            } else {
                host.to_string()
            },
            locale: if locale.is_empty() {
                Self::DEFAULT_LOCALE.to_string()
            } else {
                locale.to_string()
            },
        }
    }
}

impl Default for TargetSite {
    fn default() -> Self {
        Self::parse("")
    }
}

/// One operator form submission. Lives only as long as the job it starts.
#[derive(Debug, Clone)]
pub struct CredentialSubmission {
    pub credentials: AccountCredentials,
    pub site: TargetSite,
    /// `Host` header as the caller sent it, port included.
    pub caller_host: String,
    pub user_agent: Option<String>,
}

impl CredentialSubmission {
    /// Host part of the caller's `Host` header; the collaborator binds its proxy here.
    pub fn caller_hostname(&self) -> &str {
        let raw = self.caller_host.as_str();
        // Bracketed IPv6 literals keep their colons.
        if raw.starts_with('[') {
            return match raw.find(']') {
                Some(end) => &raw[..=end],
                None => raw,
            };
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw,
        }
    }
}
