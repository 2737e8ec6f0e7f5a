use crate::config::AppConfig;
use crate::diagnostics::{CheckResult, CheckStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

/// One diagnostic run, ready for printing.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub base_url: String,
    pub embed_origin: String,
    pub dashboard_id: String,
    pub summary: Summary,
    pub results: Vec<CheckResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
}

impl DiagnosticReport {
    pub fn new(config: &AppConfig, results: Vec<CheckResult>) -> Self {
        let mut summary = Summary::default();
        for result in &results {
            match result.status {
                CheckStatus::Pass => summary.passed += 1,
                CheckStatus::Warn => summary.warnings += 1,
                CheckStatus::Fail => summary.failed += 1,
            }
        }
        Self {
            generated_at: Utc::now(),
            base_url: config.base_url.clone(),
            embed_origin: config.embed_origin.clone(),
            dashboard_id: config.dashboard_id.to_string(),
            summary,
            results,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text rendering: one block per check, then the totals.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Superset embedding diagnostics");
        let _ = writeln!(out, "  server:    {}", self.base_url);
        let _ = writeln!(out, "  origin:    {}", self.embed_origin);
        let _ = writeln!(out, "  dashboard: {}", self.dashboard_id);
        let _ = writeln!(out, "  generated: {}", self.generated_at.to_rfc3339());
        for (index, result) in self.results.iter().enumerate() {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "{} {}. {}",
                result.status.icon(),
                index + 1,
                result.check_name
            );
            let _ = writeln!(out, "   {}", result.details);
            if !result.suggestion.is_empty() {
                let _ = writeln!(out, "   Suggestion:");
                for line in result.suggestion.lines() {
                    let _ = writeln!(out, "     {line}");
                }
            }
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} passed, {} warnings, {} failed",
            self.summary.passed, self.summary.warnings, self.summary.failed
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: CheckStatus, suggestion: &str) -> CheckResult {
        CheckResult {
            check_name: name.to_string(),
            status,
            details: format!("{name} details"),
            suggestion: suggestion.to_string(),
        }
    }

    fn sample() -> DiagnosticReport {
        DiagnosticReport::new(
            &AppConfig::default(),
            vec![
                result("Superset Reachability", CheckStatus::Pass, ""),
                result("CORS Headers", CheckStatus::Fail, "line one\nline two"),
                result("X-Frame-Options Header", CheckStatus::Warn, "look"),
            ],
        )
    }

    #[test]
    fn counts_statuses() {
        let report = sample();
        assert_eq!(
            report.summary,
            Summary {
                passed: 1,
                warnings: 1,
                failed: 1
            }
        );
        assert!(report.has_failures());
    }

    #[test]
    fn text_lists_checks_in_order_with_icons() {
        let text = sample().to_text();
        let first = text.find("✅ 1. Superset Reachability").unwrap();
        let second = text.find("❌ 2. CORS Headers").unwrap();
        let third = text.find("⚠️ 3. X-Frame-Options Header").unwrap();
        assert!(first < second && second < third);
        assert!(text.contains("     line two"));
        assert!(text.ends_with("1 passed, 1 warnings, 1 failed\n"));
    }

    #[test]
    fn json_carries_results_and_summary() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(value["results"][1]["status"], "fail");
        assert_eq!(value["summary"]["passed"], 1);
        assert_eq!(value["base_url"], "http://localhost:8088");
        assert_eq!(value["dashboard_id"], "12");
    }
}
