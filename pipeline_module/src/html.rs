use kuchiki::traits::*;
use kuchiki::NodeRef;

/// Plain-text rendering of an HTML email body.
pub(crate) fn html_to_text(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    remove_html_comments(&document);
    remove_elements_by_selector(
        &document,
        "head, script, style, meta, link, title, noscript",
    );
    remove_hidden_elements(&document);

    let root = match document.select_first("body") {
        Ok(body) => body.as_node().clone(),
        Err(()) => document,
    };
    let mut out = String::new();
    render(&root, &mut out);
    collapse_blank_lines(&out)
}

fn remove_html_comments(document: &NodeRef) {
    let nodes: Vec<NodeRef> = document.descendants().collect();
    for node in nodes {
        if node.as_comment().is_some() {
            node.detach();
        }
    }
}

fn remove_elements_by_selector(document: &NodeRef, selector: &str) {
    if let Ok(nodes) = document.select(selector) {
        let nodes: Vec<_> = nodes.collect();
        for node in nodes {
            node.as_node().detach();
        }
    }
}

fn remove_hidden_elements(document: &NodeRef) {
    let nodes: Vec<NodeRef> = document.descendants().collect();
    for node in nodes {
        let element = match node.as_element() {
            Some(value) => value,
            None => continue,
        };
        if is_hidden_element(element) {
            node.detach();
        }
    }
}

enum Step {
    Open(NodeRef),
    Close(NodeRef, Option<String>),
}

/// Walks the tree with an explicit stack so nesting depth never touches the
/// thread stack.
fn render(root: &NodeRef, out: &mut String) {
    let mut stack = vec![Step::Open(root.clone())];
    while let Some(step) = stack.pop() {
        match step {
            Step::Open(node) => open_node(node, out, &mut stack),
            Step::Close(node, tag) => close_node(&node, tag.as_deref(), out),
        }
    }
}

fn open_node(node: NodeRef, out: &mut String, stack: &mut Vec<Step>) {
    if let Some(text) = node.as_text() {
        push_inline_text(out, &text.borrow());
        return;
    }

    let tag = node
        .as_element()
        .map(|element| element.name.local.as_ref().to_string());
    match tag.as_deref() {
        Some("br") => {
            out.push('\n');
            return;
        }
        Some("hr") => {
            ensure_block_break(out);
            out.push_str("---\n");
            return;
        }
        Some("li") => {
            ensure_line_start(out);
            out.push_str("- ");
        }
        Some(tag) if is_block_tag(tag) => ensure_block_break(out),
        _ => {}
    }

    if tag.as_deref() == Some("pre") {
        out.push_str(&node.text_contents());
        stack.push(Step::Close(node, tag));
        return;
    }

    let children: Vec<NodeRef> = node.children().collect();
    stack.push(Step::Close(node, tag));
    stack.extend(children.into_iter().rev().map(Step::Open));
}

fn close_node(node: &NodeRef, tag: Option<&str>, out: &mut String) {
    if tag == Some("a") {
        if let Some(href) = link_target(node) {
            if !out.trim_end().ends_with(&href) {
                out.push_str(&format!(" ({})", href));
            }
        }
    }
    match tag {
        Some("li") | Some("tr") => ensure_line_start(out),
        Some(tag) if is_block_tag(tag) => ensure_block_break(out),
        _ => {}
    }
}

fn push_inline_text(out: &mut String, text: &str) {
    let mut pending_space = text.starts_with(char::is_whitespace);
    for word in text.split_whitespace() {
        if pending_space && !out.is_empty() && !out.ends_with(['\n', ' ']) {
            out.push(' ');
        }
        out.push_str(word);
        pending_space = true;
    }
    if text.ends_with(char::is_whitespace) && !text.trim().is_empty() {
        out.push(' ');
    }
}

fn ensure_line_start(out: &mut String) {
    trim_trailing_spaces(out);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn ensure_block_break(out: &mut String) {
    ensure_line_start(out);
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }
}

fn trim_trailing_spaces(out: &mut String) {
    while out.ends_with(' ') {
        out.pop();
    }
}

fn collapse_blank_lines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut blank_run = 0;
    for line in input.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn link_target(node: &NodeRef) -> Option<String> {
    let element = node.as_element()?;
    let attrs = element.attributes.borrow();
    let href = attrs.get("href")?.trim();
    if href.is_empty() || href.starts_with('#') || !is_safe_link(href) {
        return None;
    }
    let href = href.strip_prefix("mailto:").unwrap_or(href);
    if node.text_contents().trim() == href {
        return None;
    }
    Some(href.to_string())
}

fn is_block_tag(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "blockquote"
            | "pre"
            | "ul"
            | "ol"
            | "table"
            | "tr"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
    )
}

fn is_hidden_element(element: &kuchiki::ElementData) -> bool {
    let attrs = element.attributes.borrow();
    if attrs.contains("hidden") {
        return true;
    }
    if let Some(value) = attrs.get("aria-hidden") {
        if value.trim().eq_ignore_ascii_case("true") {
            return true;
        }
    }
    if let Some(style) = attrs.get("style") {
        if style_contains_hidden(style) {
            return true;
        }
    }
    false
}

fn style_contains_hidden(style: &str) -> bool {
    let normalized: String = style
        .to_ascii_lowercase()
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    normalized.contains("display:none")
        || normalized.contains("visibility:hidden")
        || normalized.contains("max-height:0")
}

fn is_safe_link(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    !(lower.starts_with("javascript:") || lower.starts_with("vbscript:"))
}
