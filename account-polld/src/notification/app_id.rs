//! Application ids and postal object paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Object path prefix of the postal service.
pub const POSTAL_OBJECT_PATH_PREFIX: &str = "/com/ubuntu/Postal/";

/// Click application id of the form `package_app[_version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationId(String);

impl ApplicationId {
    /// Validate an application id. Package and app parts must be non-empty.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let mut parts = id.split('_');
        let package = parts.next().unwrap_or_default();
        let valid = !package.is_empty() && parts.next().is_some_and(|app| !app.is_empty());

        if !valid {
            return Err(Error::validation(format!(
                "application id '{}' is not of the form package_app",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The click package part of the id.
    pub fn package(&self) -> &str {
        self.0.split('_').next().unwrap_or_default()
    }

    /// Postal object path for this application's package.
    ///
    /// `com.ubuntu.music_music` maps to `/com/ubuntu/Postal/com_2eubuntu_2emusic`.
    pub fn push_object_path(&self) -> String {
        let package = self.package();
        let mut path = String::with_capacity(POSTAL_OBJECT_PATH_PREFIX.len() + package.len() * 2);
        path.push_str(POSTAL_OBJECT_PATH_PREFIX);
        for c in package.chars() {
            match c {
                '+' | '.' | '-' | ':' | '~' | '_' => path.push_str(&format!("_{:x}", c as u32)),
                _ => path.push(c),
            }
        }
        path
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ApplicationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ApplicationId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<ApplicationId> for String {
    fn from(id: ApplicationId) -> Self {
        id.0
    }
}
