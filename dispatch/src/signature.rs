//! Stable failure signatures.
//!
//! A recurring test failure must hash to the same signature even when the
//! raw output differs in line numbers, timestamps, addresses, goroutine
//! ids, durations, or temp paths. Normalization replaces each volatile
//! token with a fixed placeholder, in a fixed order, before hashing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One observed test failure, pre-normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub package_path: String,
    pub test_name: String,
    pub output: String,
}

impl TestFailure {
    pub fn new(
        package_path: impl Into<String>,
        test_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            package_path: package_path.into(),
            test_name: test_name.into(),
            output: output.into(),
        }
    }

    /// Stable signature over (package, test, normalized output).
    pub fn signature(&self) -> String {
        compute_signature(&self.package_path, &self.test_name, &self.output)
    }
}

struct Rule {
    pattern: &'static str,
    replacement: &'static str,
}

// Applied strictly in order; later rules see earlier replacements.
const RULES: [Rule; 6] = [
    Rule {
        // a_test.go:42 → a_test.go:XXX
        pattern: r"(\w+\.go):\d+",
        replacement: "$1:XXX",
    },
    Rule {
        // ISO-8601-ish timestamps, with optional fraction and zone.
        pattern: r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        replacement: "TIMESTAMP",
    },
    Rule {
        // /tmp/test-workdir1234 → /tmp/XXXXX
        pattern: r"/tmp/[\w-]+\d+",
        replacement: "/tmp/XXXXX",
    },
    Rule {
        pattern: r"0x[0-9a-fA-F]+",
        replacement: "0xXXXXXXXX",
    },
    Rule {
        pattern: r"goroutine \d+",
        replacement: "goroutine XXX",
    },
    Rule {
        // 1.523s, 340ms, 12µs — collapse all durations.
        pattern: r"\b\d+(?:\.\d+)?(?:ns|µs|us|ms|s|m|h)\b",
        replacement: "X.XXXs",
    },
];

static COMPILED: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|r| (Regex::new(r.pattern).expect("static regex"), r.replacement))
        .collect()
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Replace volatile tokens with placeholders and collapse whitespace.
pub fn normalize_failure_output(raw: &str) -> String {
    let mut text = raw.to_string();
    for (regex, replacement) in COMPILED.iter() {
        text = regex.replace_all(&text, *replacement).into_owned();
    }
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// SHA-256 over `package|test|normalize(output)`, first 16 bytes as
/// lowercase hex.
pub fn compute_signature(package_path: &str, test_name: &str, output: &str) -> String {
    let normalized = normalize_failure_output(output);
    let digest = Sha256::digest(format!("{package_path}|{test_name}|{normalized}").as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}
