//! Assembles the per-service markdown context block builders and the
//! quality gate consult: seven sections in fixed priority order, with
//! truncation to a token budget that drops the lowest-priority sections
//! first and may cut a retained section mid-content.

use super::graph::{EdgeRelation, KnowledgeGraph};

pub const DEFAULT_CONTEXT_TOKEN_BUDGET: usize = 2000;
const CHARS_PER_TOKEN: usize = 4;
const TRUNCATION_MARKER: &str = "\n[... truncated ...]\n";

struct Section {
    rank: u8,
    title: &'static str,
    content: String,
}

pub struct ContextAssembler;

impl ContextAssembler {
    /// `service_node_id` is the graph node ID (`service::<name>`), not the
    /// bare service name.
    pub fn assemble(graph: &KnowledgeGraph, service_node_id: &str, context_token_budget: usize) -> String {
        let char_budget = context_token_budget.saturating_mul(CHARS_PER_TOKEN);
        let sections = vec![
            Self::dependencies_section(graph, service_node_id),
            Self::apis_to_consume_section(graph, service_node_id),
            Self::referenced_entities_section(graph, service_node_id),
            Self::provided_apis_section(graph, service_node_id),
            Self::events_section(graph, service_node_id),
            Self::owned_entities_section(graph, service_node_id),
            Self::integration_notes_section(graph, service_node_id),
        ];
        Self::render_within_budget(sections, char_budget)
    }

    fn dependencies_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let mut lines = Vec::new();
        for node in graph.outbound(service_node_id, EdgeRelation::ServiceCalls) {
            lines.push(format!("- calls {}", node.id));
        }
        for node in graph.inbound(service_node_id, EdgeRelation::ServiceCalls) {
            lines.push(format!("- called by {}", node.id));
        }
        Section {
            rank: 1,
            title: "Service Dependencies",
            content: non_empty_or_none(lines),
        }
    }

    fn apis_to_consume_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let mut lines = Vec::new();
        for contract in graph.outbound(service_node_id, EdgeRelation::DependsOnContract) {
            for endpoint in graph.outbound(&contract.id, EdgeRelation::ExposesEndpoint) {
                lines.push(format!("- {} (via {})", describe_endpoint(&endpoint.attributes, &endpoint.id), contract.id));
            }
        }
        Section {
            rank: 2,
            title: "APIs This Service Must Consume",
            content: non_empty_or_none(lines),
        }
    }

    fn referenced_entities_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let mut entities = Vec::new();
        for file in graph.outbound(service_node_id, EdgeRelation::ContainsFile) {
            for symbol in graph.outbound(&file.id, EdgeRelation::DefinesSymbol) {
                for entity in graph.outbound(&symbol.id, EdgeRelation::ImplementsEntity) {
                    let owned_elsewhere = graph
                        .inbound(&entity.id, EdgeRelation::OwnsEntity)
                        .iter()
                        .any(|owner| owner.id != service_node_id);
                    if owned_elsewhere {
                        entities.push(format!("- {}", entity.id));
                    }
                }
            }
        }
        entities.sort();
        entities.dedup();
        Section {
            rank: 3,
            title: "Referenced Entities",
            content: non_empty_or_none(entities),
        }
    }

    fn provided_apis_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let mut lines = Vec::new();
        for contract in graph.outbound(service_node_id, EdgeRelation::ProvidesContract) {
            for endpoint in graph.outbound(&contract.id, EdgeRelation::ExposesEndpoint) {
                lines.push(format!("- {}", describe_endpoint(&endpoint.attributes, &endpoint.id)));
            }
        }
        Section {
            rank: 4,
            title: "Provided APIs",
            content: non_empty_or_none(lines),
        }
    }

    fn events_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let mut lines = Vec::new();
        for node in graph.outbound(service_node_id, EdgeRelation::PublishesEvent) {
            lines.push(format!("- publishes {}", node.id));
        }
        for node in graph.outbound(service_node_id, EdgeRelation::ConsumesEvent) {
            lines.push(format!("- consumes {}", node.id));
        }
        Section {
            rank: 5,
            title: "Events Published / Consumed",
            content: non_empty_or_none(lines),
        }
    }

    fn owned_entities_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let lines = graph
            .outbound(service_node_id, EdgeRelation::OwnsEntity)
            .into_iter()
            .map(|node| format!("- {}", node.id))
            .collect();
        Section {
            rank: 6,
            title: "Owned Entities",
            content: non_empty_or_none(lines),
        }
    }

    fn integration_notes_section(graph: &KnowledgeGraph, service_node_id: &str) -> Section {
        let notes = graph
            .node(service_node_id)
            .and_then(|node| node.attributes.get("integration_notes"))
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        Section {
            rank: 7,
            title: "Integration Notes",
            content: if notes.is_empty() { "(none)".to_string() } else { notes },
        }
    }

    fn render(sections: &[Section]) -> String {
        sections
            .iter()
            .map(|s| format!("## {}\n\n{}\n", s.title, s.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Drops whole sections from the lowest rank up while over budget,
    /// then, if a single remaining section still overflows, cuts it
    /// mid-content with a trailing marker.
    fn render_within_budget(mut sections: Vec<Section>, char_budget: usize) -> String {
        sections.sort_by_key(|s| s.rank);
        while sections.len() > 1 && Self::render(&sections).len() > char_budget {
            sections.pop();
        }
        let mut rendered = Self::render(&sections);
        if rendered.len() > char_budget {
            let keep = char_budget.saturating_sub(TRUNCATION_MARKER.len());
            let cut_at = rendered.char_indices().map(|(i, _)| i).take_while(|&i| i <= keep).last().unwrap_or(0);
            rendered.truncate(cut_at);
            rendered.push_str(TRUNCATION_MARKER);
        }
        rendered
    }
}

fn describe_endpoint(attributes: &serde_json::Value, fallback_id: &str) -> String {
    let method = attributes.get("method").and_then(|v| v.as_str());
    let path = attributes.get("path").and_then(|v| v.as_str());
    match (method, path) {
        (Some(method), Some(path)) => format!("{method} {path}"),
        _ => fallback_id.to_string(),
    }
}

fn non_empty_or_none(lines: Vec<String>) -> String {
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}
