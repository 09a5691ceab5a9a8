//! Credential scoping
//!
//! Secrets never live in configuration. They are read from the environment
//! when the credentials stage runs and carried in the release context for
//! the stages that need them.

use std::fmt;

use keel_core::{ReleaseError, Result};

pub const REGISTRY_USERNAME: &str = "KEEL_REGISTRY_USERNAME";
pub const REGISTRY_PASSWORD: &str = "KEEL_REGISTRY_PASSWORD";
pub const SONAR_TOKEN: &str = "SONAR_TOKEN";
pub const CLUSTER_TOKEN: &str = "KEEL_CLUSTER_TOKEN";

/// Registry login
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a release run may authenticate with
///
/// A `None` field means "no explicit credentials"; the tool then relies on
/// whatever ambient login the host already has.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub registry: Option<RegistryCredentials>,
    pub sonar_token: Option<String>,
    pub cluster_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("registry", &self.registry)
            .field("sonar_token", &self.sonar_token.as_ref().map(|_| "<redacted>"))
            .field("cluster_token", &self.cluster_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies credentials for a release run
pub trait CredentialProvider: Send + Sync {
    fn scope(&self) -> Result<Credentials>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads credentials from environment variables
pub struct EnvCredentials {
    lookup: Lookup,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvCredentials {
    fn scope(&self) -> Result<Credentials> {
        let registry = match (self.get(REGISTRY_USERNAME), self.get(REGISTRY_PASSWORD)) {
            (Some(username), Some(password)) => Some(RegistryCredentials { username, password }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ReleaseError::CredentialsUnavailable(format!(
                    "{} is set but {} is not",
                    REGISTRY_USERNAME, REGISTRY_PASSWORD
                )));
            }
            (None, Some(_)) => {
                return Err(ReleaseError::CredentialsUnavailable(format!(
                    "{} is set but {} is not",
                    REGISTRY_PASSWORD, REGISTRY_USERNAME
                )));
            }
        };

        Ok(Credentials {
            registry,
            sonar_token: self.get(SONAR_TOKEN),
            cluster_token: self.get(CLUSTER_TOKEN),
        })
    }
}
