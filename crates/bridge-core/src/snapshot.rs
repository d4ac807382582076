//! Captured UI state, its canonical form, and change detection.
//!
//! The remote capture returns a markup body that contains attributes which
//! churn on every render (generated element ids, tooltip anchors, headless
//! UI state flags) without any visible change. Hashing the raw body would
//! notify subscribers every tick, so the body is canonicalized first and
//! only the canonical form is hashed.

use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Canonical Form
// ============================================================================

/// Generated ids that embed a per-render counter, e.g. `id="radix-P0-12"`.
static EPHEMERAL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"id="[^"]*P0-\d+[^"]*""#).expect("ephemeral id pattern must compile")
});

/// Tooltip anchors and headless UI state flags.
static UI_STATE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"data-(?:tooltip-id|headlessui-state)="[^"]*""#)
        .expect("ui state attribute pattern must compile")
});

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern must compile"));

fn canonical_pass(body: &str) -> String {
    let stripped = EPHEMERAL_ID.replace_all(body, "");
    let stripped = UI_STATE_ATTR.replace_all(&stripped, "");
    WHITESPACE_RUN.replace_all(&stripped, " ").into_owned()
}

/// Returns the canonical form of a captured markup body.
///
/// Strips volatile attributes and collapses whitespace runs to a single
/// space. Passes repeat until the output stops changing, so the result is
/// a fixed point: `canonicalize(&canonicalize(x)) == canonicalize(x)`.
///
/// Terminates because a changing pass either shortens the body or only
/// rewrites lone whitespace characters, after which the next pass is stable.
pub fn canonicalize(body: &str) -> String {
    let mut current = canonical_pass(body);
    loop {
        let next = canonical_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

// ============================================================================
// Hashing
// ============================================================================

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a digest of a canonical body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotHash(u64);

impl SnapshotHash {
    /// Returns the raw digest value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hashes an already-canonical body.
pub fn hash_canonical(canonical: &str) -> SnapshotHash {
    let digest = canonical.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    SnapshotHash(digest)
}

/// Canonicalizes and hashes a raw body.
pub fn content_hash(body: &str) -> SnapshotHash {
    hash_canonical(&canonicalize(body))
}

// ============================================================================
// Captured State
// ============================================================================

/// The value returned by the remote capture expression.
///
/// Field names follow what the capture script emits; both the current
/// names and the older `html`/`css`/`scrollInfo` spellings are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedState {
    /// Markup body of the captured UI region
    #[serde(alias = "html")]
    pub content: String,

    /// Collected stylesheet text
    #[serde(default, alias = "css")]
    pub style: String,

    /// Scroll position and extent of the captured region
    #[serde(default, alias = "scrollInfo")]
    pub scroll_metrics: Value,

    /// Capture statistics (node counts, sizes, busy flags)
    #[serde(default)]
    pub stats: Value,

    /// Any additional fields the capture script emits
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CapturedState {
    /// Interprets a capture result value.
    ///
    /// # Errors
    ///
    /// - `DomainError::CaptureFailed` if the value is a structured `{error}`
    /// - `DomainError::MissingField` if it has no content body
    /// - `DomainError::ParseError` if the shape is otherwise unusable
    pub fn from_value(value: Value) -> DomainResult<Self> {
        if let Some(reason) = value.get("error") {
            let reason = match reason {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(DomainError::CaptureFailed { reason });
        }

        if value.get("content").is_none() && value.get("html").is_none() {
            return Err(DomainError::MissingField {
                field: "content".to_string(),
            });
        }

        serde_json::from_value(value).map_err(|e| DomainError::ParseError {
            field: "captured state".to_string(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// The last accepted capture, with its canonical hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub content: String,
    pub style: String,
    pub scroll_metrics: Value,
    pub stats: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub hash: SnapshotHash,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Builds a snapshot from a capture, computing its canonical hash.
    pub fn from_captured(captured: CapturedState) -> Self {
        let hash = content_hash(&captured.content);
        Self::with_hash(captured, hash)
    }

    fn with_hash(captured: CapturedState, hash: SnapshotHash) -> Self {
        Self {
            content: captured.content,
            style: captured.style,
            scroll_metrics: captured.scroll_metrics,
            stats: captured.stats,
            extra: captured.extra,
            hash,
            captured_at: Utc::now(),
        }
    }
}

// ============================================================================
// Change Detection
// ============================================================================

/// Holds the current snapshot and decides whether a capture is new.
///
/// The stored snapshot is replaced wholesale on change; the previous one is
/// dropped once no reader holds its `Arc`.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    current: Option<Arc<Snapshot>>,
}

impl ChangeDetector {
    /// Creates a detector with no stored snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes a capture.
    ///
    /// Returns the new snapshot if its canonical hash differs from the
    /// stored one, `None` if nothing changed.
    pub fn observe(&mut self, captured: CapturedState) -> Option<Arc<Snapshot>> {
        let hash = content_hash(&captured.content);
        if self.current_hash() == Some(hash) {
            return None;
        }

        let snapshot = Arc::new(Snapshot::with_hash(captured, hash));
        self.current = Some(Arc::clone(&snapshot));
        Some(snapshot)
    }

    /// Returns the stored snapshot, if any.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.clone()
    }

    /// Returns the stored hash, if any.
    pub fn current_hash(&self) -> Option<SnapshotHash> {
        self.current.as_ref().map(|s| s.hash)
    }
}
