//! Asset manifest: the ordered list of requests materialized at install time.

use std::collections::HashSet;

use url::Url;

use super::keys::{KeyError, RequestKey};

/// Storefront shell assets cached by default.
pub const DEFAULT_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/styles.css",
    "/script.js",
    "/config.js",
    "/manifest.json",
    "/assets/icon-192.png",
    "/assets/icon-512.png",
    "/assets/farm.jpg",
    "/assets/milk.jpg",
    "/assets/buffalo.jpg",
];

/// Ordered, duplicate-free list of request keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    entries: Vec<RequestKey>,
}

impl AssetManifest {
    /// Build a manifest from keys; later duplicates are dropped.
    pub fn new(keys: impl IntoIterator<Item = RequestKey>) -> Self {
        let mut seen = HashSet::new();
        let entries = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();
        Self { entries }
    }

    /// Resolve asset paths against `origin` as GET requests.
    pub fn from_paths<S: AsRef<str>>(
        origin: &Url,
        paths: impl IntoIterator<Item = S>,
    ) -> Result<Self, KeyError> {
        let keys = paths
            .into_iter()
            .map(|path| RequestKey::get(origin, path.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(keys))
    }

    pub fn storefront_shell(origin: &Url) -> Result<Self, KeyError> {
        Self::from_paths(origin, DEFAULT_ASSETS.iter().copied())
    }

    pub fn entries(&self) -> &[RequestKey] {
        &self.entries
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("http://localhost:8080/").expect("valid origin")
    }

    #[test]
    fn storefront_shell_keeps_order() {
        let manifest = AssetManifest::storefront_shell(&origin()).expect("valid manifest");
        assert_eq!(manifest.len(), DEFAULT_ASSETS.len());
        assert_eq!(
            manifest.entries()[0].url().as_str(),
            "http://localhost:8080/"
        );
        assert_eq!(
            manifest.entries()[10].url().as_str(),
            "http://localhost:8080/assets/buffalo.jpg"
        );
    }

    #[test]
    fn duplicates_collapse_to_first_occurrence() {
        let manifest = AssetManifest::from_paths(
            &origin(),
            ["/styles.css", "/script.js", "/styles.css#print"],
        )
        .expect("valid manifest");
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.entries()[1].url().path(), "/script.js");
    }

    #[test]
    fn invalid_path_is_reported() {
        let err = AssetManifest::from_paths(&origin(), ["http://[::1"]).expect_err("bad url");
        assert!(matches!(err, KeyError::Url { .. }));
    }
}
