use html5ever::{LocalName, Namespace, QualName};
use kuchiki::traits::*;
use kuchiki::{Attribute, ExpandedName, NodeRef};
use tracing::debug;

/// Id of the element the dashboard is mounted into.
pub const MOUNT_ELEMENT_ID: &str = "dashboardWrapper";

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// An element to create under a mount point. Plain data, so it can be
/// built away from the (single-threaded) DOM and handed over later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSpec {
    name: &'static str,
    attributes: Vec<(&'static str, String)>,
    text: Option<String>,
}

impl ElementSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            text: None,
        }
    }

    pub fn attr(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.attributes.push((name, value.into()));
        self
    }

    /// Sole text child; emitted raw inside `<script>`.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    fn to_node(&self) -> NodeRef {
        let attributes = self.attributes.iter().map(|(name, value)| {
            (
                ExpandedName::new(Namespace::from(""), LocalName::from(*name)),
                Attribute {
                    prefix: None,
                    value: value.clone(),
                },
            )
        });
        let node = NodeRef::new_element(
            QualName::new(None, Namespace::from(HTML_NAMESPACE), LocalName::from(self.name)),
            attributes,
        );
        if let Some(text) = &self.text {
            node.append(NodeRef::new_text(text.clone()));
        }
        node
    }
}

/// Host page the dashboard is rendered into.
pub struct Page {
    document: NodeRef,
}

impl Page {
    pub fn parse(html: &str) -> Self {
        Self {
            document: kuchiki::parse_html().one(html),
        }
    }

    /// Minimal page holding only the mount element.
    pub fn blank() -> Self {
        Self::parse(&format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Superset dashboard</title>\n<style>html, body, #{MOUNT_ELEMENT_ID} {{ margin: 0; width: 100%; height: 100%; }}</style>\n</head>\n<body>\n<div id=\"{MOUNT_ELEMENT_ID}\"></div>\n</body>\n</html>\n"
        ))
    }

    pub fn mount(&self, id: &str) -> Option<MountPoint> {
        let selector = format!("#{id}");
        let found = self.document.select_first(&selector).ok()?;
        Some(MountPoint {
            id: id.to_string(),
            node: found.as_node().clone(),
        })
    }

    pub fn to_html(&self) -> String {
        self.document.to_string()
    }
}

/// Handle to a mount element inside a [`Page`].
pub struct MountPoint {
    id: String,
    node: NodeRef,
}

impl MountPoint {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn clear(&self) {
        let existing: Vec<_> = self.node.children().collect();
        for child in existing {
            child.detach();
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.node.first_child().is_none()
    }

    pub fn append(&self, elements: &[ElementSpec]) {
        for element in elements {
            debug!(mount = %self.id, element = element.name(), "appending to mount element");
            self.node.append(element.to_node());
        }
    }

    #[cfg(test)]
    pub fn inner_html(&self) -> String {
        self.node.children().map(|c| c.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_page_has_an_empty_mount() {
        let page = Page::blank();
        let mount = page.mount(MOUNT_ELEMENT_ID).unwrap();
        assert!(mount.is_empty());
    }

    #[test]
    fn missing_mount_is_none() {
        let page = Page::parse("<html><body><div id=\"other\"></div></body></html>");
        assert!(page.mount(MOUNT_ELEMENT_ID).is_none());
    }

    #[test]
    fn clear_then_append_replaces_content() {
        let page = Page::parse(
            "<html><body><div id=\"dashboardWrapper\"><p>old</p></div><p>keep</p></body></html>",
        );
        let mount = page.mount(MOUNT_ELEMENT_ID).unwrap();
        mount.clear();
        mount.append(&[ElementSpec::new("iframe")
            .attr("id", "supersetFrame")
            .attr("src", "http://bi/")]);

        let html = page.to_html();
        assert!(!html.contains("old"));
        assert!(html.contains("keep"));
        assert_eq!(
            mount.inner_html(),
            "<iframe id=\"supersetFrame\" src=\"http://bi/\"></iframe>"
        );
    }

    #[test]
    fn attribute_values_cannot_break_out_of_the_element() {
        let page = Page::blank();
        let mount = page.mount(MOUNT_ELEMENT_ID).unwrap();
        mount.append(&[ElementSpec::new("iframe").attr("src", "x\" onload=\"alert(1)")]);

        let html = mount.inner_html();
        assert!(html.contains("src=\"x&quot; onload=&quot;alert(1)\""), "{html}");
        assert_eq!(page.to_html().matches("onload=\"").count(), 0);
    }

    #[test]
    fn script_text_is_kept_verbatim() {
        let page = Page::blank();
        let mount = page.mount(MOUNT_ELEMENT_ID).unwrap();
        mount.append(&[ElementSpec::new("script")
            .attr("type", "module")
            .text("if (a < b && c) {}")]);

        assert_eq!(
            mount.inner_html(),
            "<script type=\"module\">if (a < b && c) {}</script>"
        );
    }
}
