//! Baseline-issue identifiers.
//!
//! A baseline issue represents a failing repository-wide quality gate.
//! Current form: `<prefix>-<4hex>-baseline-<gate>` where the hex infix
//! comes from SHA-256 of the gate name. The deprecated literal form
//! `<prefix>-baseline-<gate>` is still recognized but never generated.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label carried by every baseline issue.
pub const BASELINE_LABEL: &str = "baseline-failure";

static CURRENT_FORM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+-[0-9a-f]{4}-baseline-\w+$").expect("static regex"));
static LEGACY_FORM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+-baseline-(test|lint|build)$").expect("static regex"));

/// Repository-wide quality gates that can break the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Test,
    Lint,
    Build,
}

impl GateKind {
    pub const ALL: [GateKind; 3] = [Self::Test, Self::Lint, Self::Build];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Build => "build",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateKind {
    type Err = UnknownGate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(Self::Test),
            "lint" => Ok(Self::Lint),
            "build" => Ok(Self::Build),
            other => Err(UnknownGate(other.to_string())),
        }
    }
}

/// Error for unrecognized gate names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownGate(pub String);

impl fmt::Display for UnknownGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown quality gate: {}", self.0)
    }
}

impl std::error::Error for UnknownGate {}

/// Generate the canonical baseline issue ID for a gate.
///
/// The 4-hex infix is the first two bytes of `sha256(gate)`, keeping IDs
/// stable across processes without coordination.
pub fn baseline_issue_id(prefix: &str, gate: GateKind) -> String {
    let digest = Sha256::digest(gate.as_str().as_bytes());
    format!("{}-{:02x}{:02x}-baseline-{}", prefix, digest[0], digest[1], gate)
}

/// Whether an issue ID names a baseline issue, in either form.
pub fn is_baseline_issue(id: &str) -> bool {
    CURRENT_FORM.is_match(id) || LEGACY_FORM.is_match(id)
}

/// Extract the gate type from a baseline issue ID, accepting both forms.
pub fn gate_type(id: &str) -> Option<GateKind> {
    if !is_baseline_issue(id) {
        return None;
    }
    let (_, suffix) = id.rsplit_once("-baseline-")?;
    suffix.parse().ok()
}
