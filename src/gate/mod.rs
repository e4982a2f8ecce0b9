//! Quality Gate: a layered ensemble of scanners deciding whether a
//! freshly built system is production-eligible.

pub mod fixloop;
pub mod layers;
pub mod violation;

pub use fixloop::FixLoop;
pub use violation::{LayerResult, QualityReport, Severity, Verdict, Violation};

use std::collections::HashMap;
use std::path::Path;

use layers::{AdversarialLayer, ContractComplianceLayer, ConvergenceLayer, ScanContext, ScannerLayer, SystemLevelLayer};
use violation::dedup_violations;

use crate::graphrag::GraphRagHandle;
use crate::phase::{BuilderResult, BuilderStatus};

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub layer4_enabled: bool,
    /// Fraction of builders that must report `succeeded` for Layer 1 to
    /// consider the build converged.
    pub convergence_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            layer4_enabled: true,
            convergence_threshold: 0.8,
        }
    }
}

pub struct QualityGateEngine {
    config: GateConfig,
}

impl QualityGateEngine {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Runs all layers, Layer 1 through Layer 3 sequentially (each may
    /// read artifacts the previous layer implied), Layer 4 concurrently
    /// with Layer 3 since it only reads source trees, not prior findings.
    pub async fn run(
        &self,
        run_dir: &Path,
        builder_results: &HashMap<String, BuilderResult>,
        graph_rag: &GraphRagHandle,
        fix_attempt: u32,
    ) -> QualityReport {
        let ctx = ScanContext {
            run_dir,
            builder_results,
            graph_rag,
            fix_attempt,
            convergence_threshold: self.config.convergence_threshold,
        };

        let layer1 = ConvergenceLayer.scan(&ctx).await;
        let layer2 = ContractComplianceLayer.scan(&ctx).await;

        let layer4_enabled = self.config.layer4_enabled;
        let (layer3, layer4) = tokio::join!(SystemLevelLayer.scan(&ctx), async {
            if layer4_enabled {
                AdversarialLayer.scan(&ctx).await
            } else {
                LayerResult {
                    layer: 4,
                    passed: true,
                    violations: Vec::new(),
                    blocking_count: 0,
                }
            }
        });

        let mut all_violations = Vec::new();
        all_violations.extend(layer1.violations.clone());
        all_violations.extend(layer2.violations.clone());
        all_violations.extend(layer3.violations.clone());
        all_violations.extend(layer4.violations.clone());
        let deduped = dedup_violations(all_violations);

        let blocking_layers_clean = layer1.passed && layer2.passed && layer3.passed;
        let converged = Self::convergence(builder_results) >= self.config.convergence_threshold;

        let verdict = if !blocking_layers_clean || !converged {
            Verdict::Fail
        } else if !layer4.violations.is_empty() {
            Verdict::AdvisoryOnly
        } else {
            Verdict::Pass
        };

        let recommendations = deduped
            .iter()
            .filter(|v| !v.suggested_fix.is_empty())
            .map(|v| format!("{}: {}", v.code, v.suggested_fix))
            .collect();

        QualityReport {
            verdict,
            layer_results: vec![layer1, layer2, layer3, layer4],
            violations: deduped,
            fix_attempt,
            recommendations,
        }
    }

    /// `pass` and `advisory_only` both promote; only `fail` halts.
    pub fn should_promote(report: &QualityReport) -> bool {
        report.verdict != Verdict::Fail
    }

    fn convergence(results: &HashMap<String, BuilderResult>) -> f64 {
        if results.is_empty() {
            return 1.0;
        }
        let succeeded = results.values().filter(|r| matches!(r.status, BuilderStatus::Succeeded)).count();
        succeeded as f64 / results.len() as f64
    }
}
