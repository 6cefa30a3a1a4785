//! AI advisor interface.
//!
//! All semantic judgement — assessment, result analysis, failure
//! diagnosis, discovered-issue deduplication — is delegated to an
//! external advisory service behind the [`Advisor`] trait. The executor
//! degrades gracefully on every advisor failure: analysis is skipped,
//! dedup falls through with the raw candidate list, and a failed health
//! check releases the issue before execution.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dispatch::tracker::types::{DiscoveredIssue, Issue};

/// Pre-execution assessment of how to tackle an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub strategy: String,
    pub confidence: f32,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub should_decompose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition_plan: Option<String>,
}

/// Post-execution analysis of agent output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub completed: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub discovered_issues: Vec<DiscoveredIssue>,
    #[serde(default)]
    pub punted_items: Vec<String>,
}

/// Diagnosis of a failing test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    /// One of `flaky`, `real`, `environmental`.
    pub failure_type: String,
    pub confidence: f32,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub proposed_fix: String,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub test_names: Vec<String>,
}

/// Statistics from one deduplication pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_candidates: usize,
    pub duplicates: usize,
    pub unique: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("advisor unavailable: {0}")]
    Unavailable(String),

    #[error("advisor request failed: {0}")]
    Request(String),

    #[error("advisor returned malformed response: {0}")]
    Malformed(String),
}

/// The advisory surface. Every method may fail; callers must degrade.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Circuit-breaker probe, called before assessment.
    async fn health_check(&self) -> Result<(), AdvisorError>;

    async fn assess(&self, issue: &Issue) -> Result<Assessment, AdvisorError>;

    async fn analyze(
        &self,
        issue: &Issue,
        output: &str,
        success: bool,
    ) -> Result<Analysis, AdvisorError>;

    async fn diagnose(&self, issue: &Issue, test_output: &str) -> Result<Diagnosis, AdvisorError>;

    /// Deduplicate candidates against existing open work under `parent`.
    /// Returns the surviving unique candidates and pass statistics.
    async fn dedup(
        &self,
        parent: &Issue,
        candidates: &[DiscoveredIssue],
    ) -> Result<(Vec<DiscoveredIssue>, DedupStats), AdvisorError>;
}

/// HTTP JSON client for a remote advisor service.
pub struct HttpAdvisor {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    issue: &'a Issue,
    output: &'a str,
    success: bool,
}

#[derive(Serialize)]
struct DiagnoseRequest<'a> {
    issue: &'a Issue,
    test_output: &'a str,
}

#[derive(Serialize)]
struct DedupRequest<'a> {
    parent: &'a Issue,
    candidates: &'a [DiscoveredIssue],
}

#[derive(Deserialize)]
struct DedupResponse {
    unique: Vec<DiscoveredIssue>,
    #[serde(default)]
    stats: DedupStats,
}

impl HttpAdvisor {
    /// Client with a bounded per-call timeout so a wedged advisor cannot
    /// stall the event loop.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdvisorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, AdvisorError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AdvisorError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AdvisorError::Request(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AdvisorError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn health_check(&self) -> Result<(), AdvisorError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AdvisorError::Unavailable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdvisorError::Unavailable(format!(
                "{url} returned {}",
                response.status()
            )))
        }
    }

    async fn assess(&self, issue: &Issue) -> Result<Assessment, AdvisorError> {
        self.post("/assess", issue).await
    }

    async fn analyze(
        &self,
        issue: &Issue,
        output: &str,
        success: bool,
    ) -> Result<Analysis, AdvisorError> {
        self.post(
            "/analyze",
            &AnalyzeRequest {
                issue,
                output,
                success,
            },
        )
        .await
    }

    async fn diagnose(&self, issue: &Issue, test_output: &str) -> Result<Diagnosis, AdvisorError> {
        self.post("/diagnose", &DiagnoseRequest { issue, test_output })
            .await
    }

    async fn dedup(
        &self,
        parent: &Issue,
        candidates: &[DiscoveredIssue],
    ) -> Result<(Vec<DiscoveredIssue>, DedupStats), AdvisorError> {
        let response: DedupResponse = self
            .post("/dedup", &DedupRequest { parent, candidates })
            .await?;
        Ok((response.unique, response.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_defaults_are_lenient() {
        // Sparse advisor responses must still deserialize.
        let analysis: Analysis = serde_json::from_str(r#"{"completed": true}"#).unwrap();
        assert!(analysis.completed);
        assert!(analysis.summary.is_empty());
        assert!(analysis.discovered_issues.is_empty());

        let assessment: Assessment =
            serde_json::from_str(r#"{"strategy": "direct", "confidence": 0.9}"#).unwrap();
        assert_eq!(assessment.strategy, "direct");
        assert!(!assessment.should_decompose);
    }

    #[test]
    fn test_discovered_issue_tolerates_malformed_fields() {
        let raw = r#"{"discovered_issues": [
            {"title": "x"},
            {"title": "y", "type": "nonsense", "priority": "not-a-number"}
        ], "completed": false}"#;
        let analysis: Analysis = serde_json::from_str(raw).unwrap();
        assert_eq!(analysis.discovered_issues.len(), 2);
        assert_eq!(analysis.discovered_issues[1].priority_or_default(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_advisor_is_unavailable() {
        let advisor =
            HttpAdvisor::new("http://127.0.0.1:1", Duration::from_millis(300)).unwrap();
        let err = advisor.health_check().await.unwrap_err();
        assert!(matches!(err, AdvisorError::Unavailable(_)));
    }
}
