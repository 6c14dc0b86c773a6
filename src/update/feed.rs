use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::path::Path;

/// Source of the newest published build id.
#[async_trait]
pub trait BuildFeed: Send + Sync {
    /// Returns the latest build id, or `None` when it cannot be determined.
    async fn latest_build(&self) -> Option<String>;
}

/// [`BuildFeed`] reading a JSON document over HTTP.
///
/// The build id is located with a JSON pointer, e.g.
/// `/data/2430930/depots/branches/public/buildid`.
pub struct HttpBuildFeed {
    client: Client,
    url: String,
    pointer: String,
}

impl HttpBuildFeed {
    pub fn new(url: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            pointer: pointer.into(),
        }
    }
}

/// [`BuildFeed`] used when no feed URL is configured. Never reports a build.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownBuildFeed;

#[async_trait]
impl BuildFeed for UnknownBuildFeed {
    async fn latest_build(&self) -> Option<String> {
        None
    }
}

/// Extracts a build id from a feed document. Numbers are accepted as well as strings.
pub fn extract_build_id(document: &Value, pointer: &str) -> Option<String> {
    match document.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl BuildFeed for HttpBuildFeed {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn latest_build(&self) -> Option<String> {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "Build feed unreachable");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "Build feed returned an error");
            return None;
        }
        match response.json::<Value>().await {
            Ok(document) => extract_build_id(&document, &self.pointer),
            Err(e) => {
                tracing::debug!(error = %e, "Build feed returned invalid JSON");
                None
            }
        }
    }
}

/// Reads the installed build id from `steamapps/appmanifest_<app_id>.acf`.
pub fn installed_build_id(install_dir: &Path, app_id: &str) -> Option<String> {
    let manifest = install_dir
        .join("steamapps")
        .join(format!("appmanifest_{}.acf", app_id));
    let content = std::fs::read_to_string(manifest).ok()?;
    parse_manifest_build_id(&content)
}

fn parse_manifest_build_id(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut quoted = line.split('"').skip(1).step_by(2);
        match (quoted.next(), quoted.next()) {
            (Some(key), Some(value)) if key.eq_ignore_ascii_case("buildid") && !value.is_empty() => {
                Some(value.to_string())
            }
            _ => None,
        }
    })
}
