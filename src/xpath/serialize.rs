//! Markup output for selected nodes.

use roxmltree::{Node, NodeType};

use super::eval::XNode;

/// Appends the serialized form of `node` to `out`.
///
/// Text and attribute nodes contribute their raw string value; elements are
/// written as markup without namespace declarations.
pub(crate) fn write_node(node: XNode<'_, '_>, out: &mut String) {
    match node {
        XNode::Attribute { .. } => out.push_str(&node.string_value()),
        XNode::Tree(n) if n.is_text() => out.push_str(n.text().unwrap_or_default()),
        XNode::Tree(n) => write_tree(n, out),
    }
}

fn write_tree(node: Node<'_, '_>, out: &mut String) {
    match node.node_type() {
        NodeType::Root => {
            for child in node.children() {
                write_tree(child, out);
            }
        }
        NodeType::Element => {
            let name = XNode::Tree(node).qualified_name();
            out.push('<');
            out.push_str(&name);
            for index in 0..node.attributes().len() {
                let attr = XNode::Attribute { owner: node, index };
                out.push(' ');
                out.push_str(&attr.qualified_name());
                out.push_str("=\"");
                escape_into(&attr.string_value(), true, out);
                out.push('"');
            }
            if node.has_children() {
                out.push('>');
                for child in node.children() {
                    write_tree(child, out);
                }
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
            } else {
                out.push_str("/>");
            }
        }
        NodeType::Text => escape_into(node.text().unwrap_or_default(), false, out),
        NodeType::Comment => {
            out.push_str("<!--");
            out.push_str(node.text().unwrap_or_default());
            out.push_str("-->");
        }
        NodeType::PI => {
            if let Some(pi) = node.pi() {
                out.push_str("<?");
                out.push_str(pi.target);
                if let Some(value) = pi.value {
                    out.push(' ');
                    out.push_str(value);
                }
                out.push_str("?>");
            }
        }
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}
