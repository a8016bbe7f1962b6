//! [`Document`] over a saved HTML page.
//!
//! The page is parsed once with `scraper` and flattened into owned node
//! records; selector queries re-parse the source. Node ids are positions in
//! the parser's insertion order, so they are stable across re-parses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use scraper::{ElementRef, Html, Node, Selector};

use super::{Document, DocumentError, ELEMENT_NODE, NodeDescription, NodeId, TEXT_NODE};

const COMMENT_NODE: u32 = 8;
const DOCUMENT_NODE: u32 = 9;
const DOCUMENT_TYPE_NODE: u32 = 10;

#[derive(Debug, Clone)]
struct SnapshotNode {
    node_type: u32,
    node_name: String,
    parent: Option<usize>,
    attributes: Vec<(String, String)>,
    /// Lower-cased text of text nodes outside `<script>`/`<style>`.
    search_text: Option<String>,
    /// Element carries `hidden` or an inline `display: none`.
    hidden: bool,
    /// Serialized markup, kept for links only.
    markup: Option<String>,
}

/// Static snapshot of a rendered page.
#[derive(Debug)]
pub struct HtmlSnapshotDocument {
    source: String,
    nodes: Vec<SnapshotNode>,
    scripts_disabled: AtomicBool,
}

fn is_hidden(element: &scraper::node::Element) -> bool {
    if element.attr("hidden").is_some() {
        return true;
    }
    element.attr("style").is_some_and(|style| {
        let compact: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        compact.contains("display:none")
    })
}

impl HtmlSnapshotDocument {
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let html = Html::parse_document(source);
        let positions: HashMap<_, usize> = html
            .tree
            .nodes()
            .enumerate()
            .map(|(index, node)| (node.id(), index))
            .collect();
        let nodes = html
            .tree
            .nodes()
            .map(|node| {
                let parent = node.parent().and_then(|p| positions.get(&p.id()).copied());
                let parent_name = node
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| e.name().to_ascii_lowercase()));
                match node.value() {
                    Node::Element(element) => {
                        let is_link = element.name().eq_ignore_ascii_case("a");
                        SnapshotNode {
                            node_type: ELEMENT_NODE,
                            node_name: element.name().to_ascii_uppercase(),
                            parent,
                            attributes: element
                                .attrs()
                                .map(|(name, value)| (name.to_string(), value.to_string()))
                                .collect(),
                            search_text: None,
                            hidden: is_hidden(element),
                            markup: if is_link {
                                ElementRef::wrap(node).map(|link| link.html())
                            } else {
                                None
                            },
                        }
                    }
                    Node::Text(text) => {
                        let searchable =
                            !matches!(parent_name.as_deref(), Some("script" | "style"));
                        SnapshotNode {
                            node_type: TEXT_NODE,
                            node_name: "#text".to_string(),
                            parent,
                            attributes: Vec::new(),
                            search_text: searchable.then(|| text.to_lowercase()),
                            hidden: false,
                            markup: None,
                        }
                    }
                    other => {
                        let (node_type, node_name) = match other {
                            Node::Document | Node::Fragment => (DOCUMENT_NODE, "#document"),
                            Node::Doctype(_) => (DOCUMENT_TYPE_NODE, "html"),
                            Node::Comment(_) => (COMMENT_NODE, "#comment"),
                            _ => (0, "#other"),
                        };
                        SnapshotNode {
                            node_type,
                            node_name: node_name.to_string(),
                            parent,
                            attributes: Vec::new(),
                            search_text: None,
                            hidden: false,
                            markup: None,
                        }
                    }
                }
            })
            .collect();
        Self {
            source: source.to_string(),
            nodes,
            scripts_disabled: AtomicBool::new(false),
        }
    }

    /// Whether script execution is currently suspended.
    #[must_use]
    pub fn scripts_disabled(&self) -> bool {
        self.scripts_disabled.load(Ordering::SeqCst)
    }

    fn node(&self, id: NodeId) -> Result<&SnapshotNode, DocumentError> {
        self.nodes.get(id.0).ok_or(DocumentError::NodeNotFound(id))
    }

    fn select(&self, selector: &str) -> Result<Vec<NodeId>, DocumentError> {
        let parsed = Selector::parse(selector).map_err(|err| DocumentError::InvalidSelector {
            selector: selector.to_string(),
            reason: err.to_string(),
        })?;
        let html = Html::parse_document(&self.source);
        let positions: HashMap<_, usize> = html
            .tree
            .nodes()
            .enumerate()
            .map(|(index, node)| (node.id(), index))
            .collect();
        Ok(html
            .select(&parsed)
            .filter_map(|element| positions.get(&element.id()).copied())
            .map(NodeId)
            .collect())
    }
}

#[async_trait]
impl Document for HtmlSnapshotDocument {
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>, DocumentError> {
        self.select(selector)
    }

    async fn perform_search(&self, query: &str) -> Result<Vec<NodeId>, DocumentError> {
        let query = query.to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.search_text.as_deref().is_some_and(|t| t.contains(&query)))
            .map(|(index, _)| NodeId(index))
            .collect())
    }

    async fn describe_node(&self, node: NodeId) -> Result<NodeDescription, DocumentError> {
        let record = self.node(node)?;
        Ok(NodeDescription {
            node_type: record.node_type,
            node_name: record.node_name.clone(),
            parent_id: record.parent.map(NodeId),
        })
    }

    async fn get_attribute(
        &self,
        node: NodeId,
        name: &str,
    ) -> Result<Option<String>, DocumentError> {
        Ok(self
            .node(node)?
            .attributes
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone()))
    }

    async fn outer_html(&self, node: NodeId) -> Result<String, DocumentError> {
        self.node(node)?
            .markup
            .clone()
            .ok_or(DocumentError::Protocol {
                method: "outer_html",
                reason: format!("no markup retained for node {}", node.0),
            })
    }

    async fn has_box_model(&self, node: NodeId) -> Result<bool, DocumentError> {
        let mut current = Some(node.0);
        while let Some(index) = current {
            let record = self.node(NodeId(index))?;
            if record.hidden {
                return Ok(false);
            }
            current = record.parent;
        }
        Ok(true)
    }

    async fn set_script_execution_disabled(&self, disabled: bool) -> Result<(), DocumentError> {
        self.scripts_disabled.store(disabled, Ordering::SeqCst);
        Ok(())
    }

    fn enable_scripts_detached(&self) {
        self.scripts_disabled.store(false, Ordering::SeqCst);
    }
}
