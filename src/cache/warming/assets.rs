//! Statically declared asset sets and the route → asset map.

use std::collections::BTreeMap;

use serde::Serialize;

/// Named group of assets warmed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetSet {
    Core,
    UiCore,
    Fonts,
    Gaming,
    Navigation,
}

impl AssetSet {
    /// Sets warmed with `preload` immediately after start.
    pub const IMMEDIATE: [AssetSet; 3] = [AssetSet::Core, AssetSet::UiCore, AssetSet::Fonts];
    /// Sets warmed with `prefetch` once the system is idle.
    pub const EARLY: [AssetSet; 2] = [AssetSet::Gaming, AssetSet::Navigation];
}

/// Value of the `as` attribute on a preload hint, derived from the extension.
pub fn as_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "js" | "mjs" => "script",
        "css" => "style",
        "woff" | "woff2" | "ttf" | "otf" | "eot" => "font",
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" | "ico" => "image",
        "mp4" | "webm" => "video",
        "mp3" | "ogg" | "wav" | "m4a" => "audio",
        _ => "fetch",
    }
}

/// Which assets exist, which pages need them, and which pages need a session.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    sets: BTreeMap<AssetSet, Vec<String>>,
    routes: BTreeMap<String, Vec<String>>,
    authenticated_prefixes: Vec<String>,
}

impl AssetCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The asset layout shipped with the frontend build.
    pub fn standard() -> Self {
        let set = |urls: &[&str]| urls.iter().map(|url| url.to_string()).collect::<Vec<_>>();
        Self::empty()
            .with_set(
                AssetSet::Core,
                set(&["/static/js/runtime.js", "/static/js/app.js", "/static/css/app.css"]),
            )
            .with_set(
                AssetSet::UiCore,
                set(&["/static/js/ui-core.js", "/static/css/ui-core.css", "/manifest.json"]),
            )
            .with_set(
                AssetSet::Fonts,
                set(&["/static/fonts/inter.woff2", "/static/fonts/inter-bold.woff2"]),
            )
            .with_set(
                AssetSet::Gaming,
                set(&["/static/js/gaming.js", "/static/css/gaming.css", "/static/audio/ui.mp3"]),
            )
            .with_set(
                AssetSet::Navigation,
                set(&["/static/js/router.js", "/static/img/sprites.svg"]),
            )
            .with_route("/", set(&["/static/js/home.js", "/static/img/hero.webp"]))
            .with_route("/games", set(&["/static/js/gaming.js", "/static/css/gaming.css"]))
            .with_route("/clans", set(&["/static/js/clans.js", "/api/clans"]))
            .with_route("/profile", set(&["/static/js/profile.js", "/api/profile"]))
            .with_route("/dao", set(&["/static/js/dao.js", "/api/proposals"]))
            .with_authenticated_prefix("/profile")
            .with_authenticated_prefix("/dao")
    }

    pub fn with_set(mut self, set: AssetSet, urls: Vec<String>) -> Self {
        self.sets.insert(set, urls);
        self
    }

    pub fn with_route(mut self, path: impl Into<String>, urls: Vec<String>) -> Self {
        self.routes.insert(path.into(), urls);
        self
    }

    /// Pages under `prefix` are only warmed while a session is active.
    pub fn with_authenticated_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.authenticated_prefixes.push(prefix.into());
        self
    }

    pub fn set(&self, set: AssetSet) -> &[String] {
        self.sets.get(&set).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn assets_for(&self, path: &str) -> &[String] {
        self.routes.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn requires_session(&self, path: &str) -> bool {
        self.authenticated_prefixes.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_type_follows_extension() {
        assert_eq!(as_type("/static/app.js?v=2"), "script");
        assert_eq!(as_type("/static/app.CSS"), "style");
        assert_eq!(as_type("/fonts/a.woff2"), "font");
        assert_eq!(as_type("/img/a.webp"), "image");
        assert_eq!(as_type("/media/intro.webm"), "video");
        assert_eq!(as_type("/media/click.ogg"), "audio");
        assert_eq!(as_type("/api/clans"), "fetch");
    }

    #[test]
    fn authenticated_prefix_matches_whole_segments() {
        let catalog = AssetCatalog::standard();
        assert!(catalog.requires_session("/profile"));
        assert!(catalog.requires_session("/profile/42"));
        assert!(!catalog.requires_session("/profiles"));
        assert!(!catalog.requires_session("/clans"));
    }

    #[test]
    fn unknown_route_has_no_assets() {
        let catalog = AssetCatalog::standard();
        assert!(catalog.assets_for("/nowhere").is_empty());
        assert_eq!(catalog.set(AssetSet::Fonts).len(), 2);
    }
}
