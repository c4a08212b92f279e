//! Cache key definitions.
//!
//! `GenerationId` names one generation of the asset cache; `RequestKey`
//! identifies a single entry inside a generation.

use std::fmt;
use std::str::FromStr;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const MAX_GENERATION_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("generation id must not be empty")]
    EmptyGeneration,
    #[error("generation id exceeds {MAX_GENERATION_LEN} bytes")]
    GenerationTooLong,
    #[error("generation id `{0}` contains characters outside [A-Za-z0-9._-]")]
    InvalidGeneration(String),
    #[error("failed to resolve `{input}` against `{base}`: {source}")]
    Url {
        input: String,
        base: String,
        #[source]
        source: url::ParseError,
    },
}

/// Identifier of one cache generation, e.g. `lakshmi-dairy-v1`.
///
/// Restricted to a filesystem-safe alphabet so that every store backend can
/// use it verbatim as a name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GenerationId(String);

impl GenerationId {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        if value.is_empty() {
            return Err(KeyError::EmptyGeneration);
        }
        if value.len() > MAX_GENERATION_LEN {
            return Err(KeyError::GenerationTooLong);
        }
        // Leading dots would collide with hidden and temporary directory names.
        let valid = !value.starts_with('.')
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if !valid {
            return Err(KeyError::InvalidGeneration(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GenerationId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for GenerationId {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GenerationId> for String {
    fn from(value: GenerationId) -> Self {
        value.0
    }
}

/// Identity of a cached request: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: Url,
}

impl RequestKey {
    pub fn new(method: Method, mut url: Url) -> Self {
        url.set_fragment(None);
        Self { method, url }
    }

    /// GET key for `input`, which may be absolute or relative to `origin`.
    pub fn get(origin: &Url, input: &str) -> Result<Self, KeyError> {
        Self::resolve(Method::GET, origin, input)
    }

    pub fn resolve(method: Method, origin: &Url, input: &str) -> Result<Self, KeyError> {
        let url = origin.join(input).map_err(|source| KeyError::Url {
            input: input.to_string(),
            base: origin.to_string(),
            source,
        })?;
        Ok(Self::new(method, url))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// True when scheme, host and port all match `origin`.
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }

    /// Only GET requests are ever served from a generation.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://shop.example/").expect("valid origin")
    }

    #[test]
    fn generation_id_accepts_versioned_names() {
        let id = GenerationId::new("lakshmi-dairy-v1").expect("valid id");
        assert_eq!(id.as_str(), "lakshmi-dairy-v1");
        assert!(GenerationId::new("shell_2024.10").is_ok());
    }

    #[test]
    fn generation_id_rejects_unsafe_names() {
        assert_eq!(GenerationId::new(""), Err(KeyError::EmptyGeneration));
        assert!(matches!(
            GenerationId::new("../escape"),
            Err(KeyError::InvalidGeneration(_))
        ));
        assert!(matches!(
            GenerationId::new(".tmp"),
            Err(KeyError::InvalidGeneration(_))
        ));
        assert!(matches!(
            GenerationId::new("a b"),
            Err(KeyError::InvalidGeneration(_))
        ));
        assert_eq!(
            GenerationId::new("x".repeat(MAX_GENERATION_LEN + 1)),
            Err(KeyError::GenerationTooLong)
        );
    }

    #[test]
    fn generation_id_deserializes_with_validation() {
        let id: GenerationId = serde_json::from_str("\"v2\"").expect("valid json id");
        assert_eq!(id.to_string(), "v2");
        assert!(serde_json::from_str::<GenerationId>("\"no/slash\"").is_err());
    }

    #[test]
    fn request_key_resolves_relative_paths_and_drops_fragment() {
        let key = RequestKey::get(&origin(), "/assets/milk.jpg#hero").expect("valid key");
        assert_eq!(key.url().as_str(), "https://shop.example/assets/milk.jpg");
        assert_eq!(key.method(), &Method::GET);
        assert_eq!(
            key,
            RequestKey::get(&origin(), "https://shop.example/assets/milk.jpg").expect("valid key")
        );
    }

    #[test]
    fn request_key_distinguishes_method_and_query() {
        let get = RequestKey::get(&origin(), "/script.js").expect("valid key");
        let head =
            RequestKey::resolve(Method::HEAD, &origin(), "/script.js").expect("valid key");
        let query = RequestKey::get(&origin(), "/script.js?v=2").expect("valid key");
        assert_ne!(get, head);
        assert_ne!(get, query);
        assert!(get.is_cacheable());
        assert!(!head.is_cacheable());
    }

    #[test]
    fn scheme_relative_input_leaves_the_origin() {
        let local = RequestKey::get(&origin(), "/cart?item=ghee").expect("valid key");
        assert!(local.is_same_origin(&origin()));

        let foreign = RequestKey::get(&origin(), "//evil.example/steal").expect("valid key");
        assert_eq!(foreign.url().host_str(), Some("evil.example"));
        assert!(!foreign.is_same_origin(&origin()));

        let other_port =
            RequestKey::get(&origin(), "https://shop.example:8443/").expect("valid key");
        assert!(!other_port.is_same_origin(&origin()));
        let other_scheme = RequestKey::get(&origin(), "http://shop.example/").expect("valid key");
        assert!(!other_scheme.is_same_origin(&origin()));
    }
}
