use anyhow::Result;
use rusqlite::Connection;

use crate::error::PipelineError;
use crate::model::ProcessNode;
use crate::store;
use crate::util::truncate_chars;

/// Ancestor descriptions are quoted at most this long; full descriptions
/// belong to the target node only.
const ANCESTOR_DESCRIPTION_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub include_branch: bool,
    pub cross_category: bool,
    pub max_chars: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_branch: false,
            cross_category: false,
            max_chars: 6000,
        }
    }
}

/// Assemble the bounded hierarchical text context for one node.
///
/// The hierarchy block lists ancestors root-first with an indent per
/// level; the node itself gets its own block below. When the rendered
/// context exceeds the budget, the most distant ancestor is dropped
/// first, since the closer context is the more specific one.
pub fn build_context(
    connection: &Connection,
    node: &ProcessNode,
    options: &ContextOptions,
) -> Result<String> {
    let ancestors = store::get_ancestors(connection, node)?;

    let node_described = has_description(node);
    if !node_described && !ancestors.iter().any(has_description) {
        return Err(PipelineError::ContextUnavailable {
            node_id: node.id,
            reason: "no description on the node or any ancestor".to_string(),
        }
        .into());
    }

    let mut extra_sections = Vec::new();

    if options.include_branch {
        let siblings = store::siblings(connection, node)?;
        if !siblings.is_empty() {
            extra_sections.push(name_list_section("Sibling Processes:", &siblings));
        }

        let children = store::children(connection, node.id)?;
        if !children.is_empty() {
            extra_sections.push(name_list_section("Subprocesses:", &children));
        }
    }

    if options.cross_category {
        let variants = store::variant_matches(connection, node)?;
        if !variants.is_empty() {
            extra_sections.push(variant_section(&variants));
        }
    }

    let mut first_ancestor = 0;
    loop {
        let rendered = render(&ancestors[first_ancestor..], node, &extra_sections);

        if rendered.chars().count() <= options.max_chars {
            return Ok(rendered);
        }
        if first_ancestor >= ancestors.len() {
            return Ok(truncate_chars(&rendered, options.max_chars).to_string());
        }

        first_ancestor += 1;
    }
}

fn has_description(node: &ProcessNode) -> bool {
    node.description
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty())
}

fn render(ancestors: &[ProcessNode], node: &ProcessNode, extra_sections: &[String]) -> String {
    let mut lines = Vec::new();

    for ancestor in ancestors {
        let indent = "  ".repeat(ancestor.level.max(1) as usize - 1);
        lines.push(format!("{indent}[{}] {}", ancestor.code, ancestor.name));

        if let Some(description) = ancestor.description.as_deref()
            && !description.trim().is_empty()
        {
            lines.push(format!(
                "{indent}    {}",
                truncate_chars(description, ANCESTOR_DESCRIPTION_CHARS)
            ));
        }
    }

    let mut out = String::from("Process Hierarchy:\n");
    out.push_str(&lines.join("\n"));
    out.push_str("\n\nCurrent Process:\n");
    out.push_str(&format!("[{}] {}\n", node.code, node.name));
    out.push_str(&format!("Level: {}\n", node.level));
    out.push_str(&format!(
        "Description: {}",
        node.description
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or("No description provided")
    ));

    for section in extra_sections {
        out.push_str("\n\n");
        out.push_str(section);
    }

    out
}

fn name_list_section(heading: &str, nodes: &[ProcessNode]) -> String {
    let mut section = String::from(heading);
    for node in nodes {
        section.push_str(&format!("\n[{}] {}", node.code, node.name));
    }
    section
}

fn variant_section(variants: &[ProcessNode]) -> String {
    let mut section = String::from("Related Industry Processes:");
    for variant in variants {
        section.push_str(&format!("\n[{}] {}", variant.model_key, variant.name));
        if let Some(description) = variant.description.as_deref()
            && !description.trim().is_empty()
        {
            section.push_str(&format!(
                " - {}",
                truncate_chars(description, ANCESTOR_DESCRIPTION_CHARS)
            ));
        }
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{insert_node, open_in_memory};

    fn seed_tree(connection: &Connection) {
        insert_node(connection, 1, "apqc_pcf", Some("10002"), "1.0", "Develop Vision and Strategy", Some("Set the long-term direction"), None, 1);
        insert_node(connection, 2, "apqc_pcf", Some("10017"), "1.1.1", "Develop vision", Some("Articulate the vision statement"), Some(1), 2);
        insert_node(connection, 3, "apqc_pcf", Some("10018"), "1.1.2", "Evaluate strategy", Some("Review strategic options"), Some(1), 2);
    }

    #[test]
    fn context_contains_node_and_ancestor_but_no_siblings_by_default() {
        let connection = open_in_memory();
        seed_tree(&connection);

        let node = store::get_node(&connection, 2).expect("query").expect("node");
        let context =
            build_context(&connection, &node, &ContextOptions::default()).expect("context");

        assert!(context.contains("Develop vision"));
        assert!(context.contains("Articulate the vision statement"));
        assert!(context.contains("Develop Vision and Strategy"));
        assert!(!context.contains("Evaluate strategy"));
    }

    #[test]
    fn include_branch_adds_sibling_names() {
        let connection = open_in_memory();
        seed_tree(&connection);

        let node = store::get_node(&connection, 2).expect("query").expect("node");
        let options = ContextOptions {
            include_branch: true,
            ..ContextOptions::default()
        };
        let context = build_context(&connection, &node, &options).expect("context");

        assert!(context.contains("Sibling Processes:"));
        assert!(context.contains("Evaluate strategy"));
    }

    #[test]
    fn cross_category_adds_matching_variants_only() {
        let connection = open_in_memory();
        seed_tree(&connection);
        insert_node(&connection, 10, "apqc_pcf_retail", Some("10017"), "4.2.1", "Develop vision", Some("Articulate the vision statement"), None, 1);
        insert_node(&connection, 11, "apqc_pcf_lifescience", Some("10017"), "5.1.1", "Develop vision", Some("A different framing"), None, 1);

        let node = store::get_node(&connection, 2).expect("query").expect("node");
        let options = ContextOptions {
            cross_category: true,
            ..ContextOptions::default()
        };
        let context = build_context(&connection, &node, &options).expect("context");

        assert!(context.contains("Related Industry Processes:"));
        assert!(context.contains("apqc_pcf_retail"));
        assert!(!context.contains("apqc_pcf_lifescience"));
    }

    #[test]
    fn budget_drops_most_distant_ancestor_first() {
        let connection = open_in_memory();
        let long_root_description = "root context ".repeat(100);
        insert_node(&connection, 1, "apqc_pcf", None, "1.0", "Root category", Some(long_root_description.as_str()), None, 1);
        insert_node(&connection, 2, "apqc_pcf", None, "1.1", "Middle group", Some("Close-in context"), Some(1), 2);
        insert_node(&connection, 3, "apqc_pcf", None, "1.1.1", "Target process", Some("Target description"), Some(2), 3);

        let node = store::get_node(&connection, 3).expect("query").expect("node");
        let options = ContextOptions {
            max_chars: 300,
            ..ContextOptions::default()
        };
        let context = build_context(&connection, &node, &options).expect("context");

        assert!(context.chars().count() <= 300);
        assert!(!context.contains("Root category"));
        assert!(context.contains("Middle group"));
        assert!(context.contains("Target process"));
    }

    #[test]
    fn degenerate_empty_context_is_an_error() {
        let connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.0", "Root", None, None, 1);
        insert_node(&connection, 2, "apqc_pcf", None, "1.1", "Child", Some("   "), Some(1), 2);

        let node = store::get_node(&connection, 2).expect("query").expect("node");
        let err = build_context(&connection, &node, &ContextOptions::default())
            .expect_err("should fail");

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ContextUnavailable { node_id: 2, .. })
        ));
    }
}
