//! Issue summary aggregation
//!
//! Pure derivation of [`IssuesSummary`] from a finished issue set. Safe
//! to recompute at any time; feeds both event payloads and API DTOs.

use codecrow_protocol::{Issue, IssueSeverity, IssuesSummary};

/// Derive severity and category counts from an issue list
///
/// Category counting is a case-insensitive substring match on the
/// free-text category, so "Security/OWASP" counts as security and
/// "code quality & style" counts as both quality and style. Issues
/// without a category contribute to the total only.
pub fn summarize_issues(issues: &[Issue]) -> IssuesSummary {
    let mut summary = IssuesSummary {
        total_issues: issues.len() as u32,
        ..IssuesSummary::default()
    };

    for issue in issues {
        match issue.severity {
            IssueSeverity::High => summary.high_count += 1,
            IssueSeverity::Medium => summary.medium_count += 1,
            IssueSeverity::Low => summary.low_count += 1,
        }

        if let Some(category) = &issue.category {
            let category = category.to_lowercase();
            if category.contains("security") {
                summary.security_count += 1;
            }
            if category.contains("quality") {
                summary.quality_count += 1;
            }
            if category.contains("performance") {
                summary.performance_count += 1;
            }
            if category.contains("style") {
                summary.style_count += 1;
            }
        }
    }

    summary
}
