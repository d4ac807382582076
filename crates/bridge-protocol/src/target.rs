//! Debug target descriptors.

use serde::{Deserialize, Serialize};

/// One entry of a debug endpoint's `/json/list` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    #[serde(default)]
    pub id: String,

    /// Target kind: `page`, `iframe`, `service_worker`, ...
    #[serde(rename = "type", default)]
    pub target_type: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Control socket URL; absent when another client already attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    /// Returns true for top-level page targets.
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }

    /// Returns the control socket URL if the target is attachable.
    pub fn socket_url(&self) -> Option<&str> {
        self.web_socket_debugger_url
            .as_deref()
            .filter(|url| !url.is_empty())
    }
}
