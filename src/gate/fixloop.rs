//! Fix Loop: turns a failed `QualityReport` into per-service
//! `FIX_INSTRUCTIONS.md` files. Re-invoking the Builder Fleet, re-running
//! the Quality Gate, and tracking `fix_attempts` against
//! `max_fix_retries` is the Pipeline Engine's job — this module only
//! covers classification, grouping, and instruction authoring.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::graphrag::{GraphRagHandle, KnowledgeGraph, NodeType};

use super::violation::{QualityReport, Severity, Violation};

pub const MAX_DEPENDENTS_LISTED: usize = 10;
pub const CROSS_SERVICE_IMPACT_BOOST_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    fn base(severity: Severity) -> Priority {
        match severity {
            Severity::Error => Priority::P0,
            Severity::Warning => Priority::P1,
            Severity::Advisory | Severity::Info => Priority::P2,
        }
    }

    fn bump(self) -> Priority {
        match self {
            Priority::P0 => Priority::P0,
            Priority::P1 => Priority::P0,
            Priority::P2 => Priority::P1,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        }
    }
}

pub struct FixLoop;

impl FixLoop {
    /// Base priority from severity/code family, boosted one level when
    /// the violated file's cross-service impact exceeds the threshold.
    pub async fn classify_priority(violation: &Violation, graph_rag: &GraphRagHandle) -> Priority {
        let base = Priority::base(violation.severity);
        let node_id = KnowledgeGraph::node_id(NodeType::File, &violation.file_path);
        let impact = graph_rag.find_cross_service_impact(&node_id).await;
        if impact.len() > CROSS_SERVICE_IMPACT_BOOST_THRESHOLD {
            base.bump()
        } else {
            base
        }
    }

    pub async fn group_by_service(report: &QualityReport, graph_rag: &GraphRagHandle) -> HashMap<String, Vec<(Priority, Violation)>> {
        let mut grouped: HashMap<String, Vec<(Priority, Violation)>> = HashMap::new();
        for violation in &report.violations {
            let priority = Self::classify_priority(violation, graph_rag).await;
            grouped.entry(violation.service.clone()).or_default().push((priority, violation.clone()));
        }
        for entries in grouped.values_mut() {
            entries.sort_by_key(|(priority, _)| *priority);
        }
        grouped
    }

    pub async fn write_instructions(
        run_dir: &Path,
        service_name: &str,
        entries: &[(Priority, Violation)],
        graph_rag: &GraphRagHandle,
    ) -> std::io::Result<PathBuf> {
        let mut markdown = format!("# Fix Instructions for {service_name}\n\n");
        for priority in [Priority::P0, Priority::P1, Priority::P2] {
            let section: Vec<&(Priority, Violation)> = entries.iter().filter(|(p, _)| *p == priority).collect();
            if section.is_empty() {
                continue;
            }
            markdown.push_str(&format!("## {}\n\n", priority.label()));
            for (_, violation) in section {
                markdown.push_str(&format!(
                    "- `{}` at `{}:{}` — {}\n  - evidence: {}\n  - action: {}\n",
                    violation.code,
                    violation.file_path,
                    violation.line,
                    violation.message,
                    if violation.evidence.is_empty() { "(none)" } else { &violation.evidence },
                    if violation.suggested_fix.is_empty() { "(no suggestion)" } else { &violation.suggested_fix },
                ));
            }
            markdown.push('\n');
        }

        if graph_rag.is_enabled() {
            let mut dependents = Vec::new();
            for (_, violation) in entries {
                let node_id = KnowledgeGraph::node_id(NodeType::File, &violation.file_path);
                dependents.extend(graph_rag.find_cross_service_impact(&node_id).await);
            }
            dependents.sort();
            dependents.dedup();
            dependents.truncate(MAX_DEPENDENTS_LISTED);
            if !dependents.is_empty() {
                markdown.push_str("## Dependencies Warning\n\n");
                markdown.push_str("Changing these files may affect the following one-hop dependents:\n\n");
                for dep in &dependents {
                    markdown.push_str(&format!("- {dep}\n"));
                }
                markdown.push('\n');
            }
        }

        let output_dir = run_dir.join(service_name);
        std::fs::create_dir_all(&output_dir)?;
        let path = output_dir.join("FIX_INSTRUCTIONS.md");
        std::fs::write(&path, markdown)?;
        Ok(path)
    }

    /// Writes `FIX_INSTRUCTIONS.md` for every affected service, returning
    /// their names so the caller can scope the next Builder Fleet
    /// invocation to exactly those services.
    pub async fn prepare(run_dir: &Path, report: &QualityReport, graph_rag: &GraphRagHandle) -> std::io::Result<Vec<String>> {
        let grouped = Self::group_by_service(report, graph_rag).await;
        let mut affected = Vec::new();
        for (service_name, entries) in &grouped {
            Self::write_instructions(run_dir, service_name, entries, graph_rag).await?;
            affected.push(service_name.clone());
        }
        affected.sort();
        Ok(affected)
    }
}
