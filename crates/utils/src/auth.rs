use std::{fmt::Display, str::FromStr};

use tracing::{debug, info, warn};

use crate::LoginCredentials;

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur during authentication.
///
/// The display text is what the client gets to see, so it never says
/// which of the two fields was wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The mechanism is neither `LOGIN` nor `PLAIN`.
    UnsupportedMechanism,
    /// The provided credentials are invalid.
    InvalidCredentials,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::UnsupportedMechanism => write!(f, "Unsupported authentication mechanism"),
            AuthError::InvalidCredentials => write!(f, "Invalid credentials"),
        }
    }
}

impl std::error::Error for AuthError {}

/// SASL mechanism named in an `AUTH` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMechanism {
    Login,
    Plain,
    Other(String),
}

impl AuthMechanism {
    pub fn as_str(&self) -> &str {
        match self {
            AuthMechanism::Login => "LOGIN",
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Other(name) => name,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "LOGIN" => AuthMechanism::Login,
            "PLAIN" => AuthMechanism::Plain,
            other => AuthMechanism::Other(other.to_string()),
        })
    }
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Username and password supplied by a client for one `AUTH` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub username: String,
    pub password: String,
}

impl AuthCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Outcome of an authentication attempt as seen by the protocol engine.
///
/// A failure with `handled == false` tells the engine to answer with its
/// own generic reply instead of `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub handled: bool,
}

impl From<AuthResult<()>> for AuthOutcome {
    fn from(result: AuthResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                message: None,
                handled: true,
            },
            Err(error) => Self {
                success: false,
                message: Some(error.to_string()),
                handled: false,
            },
        }
    }
}

/// Trait for authentication engines plugged into the SMTP session.
pub trait AuthEngine: Send + Sync {
    /// Checks `credential` for the given mechanism.
    fn authenticate(&self, mechanism: &AuthMechanism, credential: &AuthCredential) -> AuthOutcome;

    /// Whether sessions must authenticate before `MAIL FROM`.
    fn auth_required(&self) -> bool;
}

/// Authentication engine holding the single proxy identity.
///
/// Without an identity no session needs to authenticate, and any attempt
/// that is made anyway fails.
#[derive(Debug, Clone, Default)]
pub struct SingleIdentityAuthEngine {
    identity: Option<LoginCredentials>,
}

impl SingleIdentityAuthEngine {
    pub fn new(identity: Option<LoginCredentials>) -> Self {
        if identity.is_none() {
            warn!("Proxy credentials not set, clients can relay without authentication");
        }
        Self { identity }
    }

    fn verify(&self, mechanism: &AuthMechanism, credential: &AuthCredential) -> AuthResult<()> {
        if matches!(mechanism, AuthMechanism::Other(_)) {
            warn!(mechanism = %mechanism, "Unsupported authentication mechanism");
            return Err(AuthError::UnsupportedMechanism);
        }

        let expected = self.identity.as_ref();
        info!(
            username = %credential.username,
            valid_username = expected.map(|identity| identity.username.as_str()).unwrap_or_default(),
            "Attempting to authenticate user"
        );

        let username_ok = expected.is_some_and(|identity| identity.username == credential.username);
        let password_ok = expected.is_some_and(|identity| identity.password == credential.password);
        if username_ok && password_ok {
            info!(username = %credential.username, "Authentication successful");
            return Ok(());
        }

        if !username_ok {
            debug!(username = %credential.username, "Invalid username");
        }
        if !password_ok {
            debug!(username = %credential.username, "Invalid password");
        }
        warn!(username = %credential.username, "Authentication failed");
        Err(AuthError::InvalidCredentials)
    }
}

impl AuthEngine for SingleIdentityAuthEngine {
    fn authenticate(&self, mechanism: &AuthMechanism, credential: &AuthCredential) -> AuthOutcome {
        self.verify(mechanism, credential).into()
    }

    fn auth_required(&self) -> bool {
        self.identity.is_some()
    }
}
