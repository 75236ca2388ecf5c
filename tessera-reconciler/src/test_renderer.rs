//! An in-memory host tree for tests and tools.
//!
//! ## Usage
//!
//! [`TestRenderer`] implements [`HostConfig`] on a flat node table. It
//! serializes the visible tree with [`TestRenderer::markup`] and records
//! every host mutation so tests can assert on commit ordering.
//!
//! ```
//! use tessera_reconciler::{HostConfig, HostProps, test_renderer::TestRenderer};
//!
//! let mut host = TestRenderer::default();
//! let div = host.create_instance("div", &HostProps::new().with("id", "a"));
//! let text = host.create_text_instance("hi");
//! host.append_initial_child(&div, &text);
//! host.append_child_to_container(&(), &div);
//! assert_eq!(host.markup(), r#"<div id="a">hi</div>"#);
//! ```

use std::fmt::Write as _;

use rustc_hash::FxHashMap as HashMap;

use crate::{element::HostProps, host::HostConfig};

/// Handle to a node owned by a [`TestRenderer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestInstance(pub u32);

/// One mutation applied to the host tree. `None` as a parent stands for
/// the container.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HostOp {
    /// An element was created.
    Create { id: TestInstance, tag: String },
    /// A text node was created.
    CreateText { id: TestInstance, text: String },
    /// `child` was appended to `parent`.
    Append { parent: Option<TestInstance>, child: TestInstance },
    /// `child` was inserted before `before`.
    Insert {
        parent: Option<TestInstance>,
        child: TestInstance,
        before: TestInstance,
    },
    /// `child` was removed.
    Remove { parent: Option<TestInstance>, child: TestInstance },
    /// Attributes of an element changed.
    Update { id: TestInstance },
    /// A text node changed.
    UpdateText { id: TestInstance, text: String },
    /// A node was hidden.
    Hide(TestInstance),
    /// A node was shown again.
    Unhide(TestInstance),
    /// The container was cleared before the first commit.
    ClearContainer,
}

#[derive(Debug, Clone)]
enum NodeContent {
    Element { tag: String, props: HostProps },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    content: NodeContent,
    children: Vec<TestInstance>,
    hidden: bool,
}

/// In-memory implementation of [`HostConfig`] rendering into a single
/// container.
#[derive(Debug, Default)]
pub struct TestRenderer {
    next_id: u32,
    nodes: HashMap<TestInstance, Node>,
    container: Vec<TestInstance>,
    ops: Vec<HostOp>,
    focused: Option<TestInstance>,
    commits: usize,
    blurs: usize,
}

impl TestRenderer {
    /// Serializes the visible part of the container. Hidden nodes are skipped.
    pub fn markup(&self) -> String {
        self.serialize(false)
    }

    /// Serializes the container including hidden nodes, which carry a
    /// `hidden` attribute.
    pub fn markup_with_hidden(&self) -> String {
        self.serialize(true)
    }

    /// Mutations recorded since the last [`TestRenderer::take_ops`].
    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }

    /// Drains the mutation log.
    pub fn take_ops(&mut self) -> Vec<HostOp> {
        std::mem::take(&mut self.ops)
    }

    /// Marks `instance` as focused.
    pub fn focus(&mut self, instance: Option<TestInstance>) {
        self.focused = instance;
    }

    /// The focused instance.
    pub fn focused(&self) -> Option<TestInstance> {
        self.focused
    }

    /// Number of finished commits.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Number of times the focused instance was detached.
    pub fn blur_count(&self) -> usize {
        self.blurs
    }

    /// Whether `instance` still exists in the node table.
    pub fn contains(&self, instance: TestInstance) -> bool {
        self.nodes.contains_key(&instance)
    }

    /// Reads an attribute of an element.
    pub fn attribute(&self, instance: TestInstance, key: &str) -> Option<&str> {
        match &self.nodes.get(&instance)?.content {
            NodeContent::Element { props, .. } => props.get(key),
            NodeContent::Text(_) => None,
        }
    }

    /// Whether `instance` is hidden.
    pub fn is_hidden(&self, instance: TestInstance) -> bool {
        self.nodes.get(&instance).is_some_and(|node| node.hidden)
    }

    fn allocate(&mut self, content: NodeContent) -> TestInstance {
        self.next_id += 1;
        let id = TestInstance(self.next_id);
        self.nodes.insert(
            id,
            Node {
                content,
                children: Vec::new(),
                hidden: false,
            },
        );
        id
    }

    fn children_mut(&mut self, parent: Option<TestInstance>) -> Option<&mut Vec<TestInstance>> {
        match parent {
            Some(parent) => self.nodes.get_mut(&parent).map(|node| &mut node.children),
            None => Some(&mut self.container),
        }
    }

    fn detach(&mut self, parent: Option<TestInstance>, child: TestInstance) {
        if let Some(children) = self.children_mut(parent) {
            children.retain(|existing| *existing != child);
        }
    }

    fn append(&mut self, parent: Option<TestInstance>, child: TestInstance) {
        self.detach(parent, child);
        if let Some(children) = self.children_mut(parent) {
            children.push(child);
        }
        self.ops.push(HostOp::Append { parent, child });
    }

    fn insert(&mut self, parent: Option<TestInstance>, child: TestInstance, before: TestInstance) {
        self.detach(parent, child);
        if let Some(children) = self.children_mut(parent) {
            let index = children
                .iter()
                .position(|existing| *existing == before)
                .unwrap_or(children.len());
            children.insert(index, child);
        }
        self.ops.push(HostOp::Insert { parent, child, before });
    }

    fn remove(&mut self, parent: Option<TestInstance>, child: TestInstance) {
        self.detach(parent, child);
        self.drop_subtree(child);
        self.ops.push(HostOp::Remove { parent, child });
    }

    fn drop_subtree(&mut self, instance: TestInstance) {
        let mut stack = vec![instance];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                stack.extend(node.children);
            }
            if self.focused == Some(id) {
                self.focused = None;
            }
        }
    }

    fn serialize(&self, include_hidden: bool) -> String {
        let mut out = String::new();
        for child in &self.container {
            self.write_node(&mut out, *child, include_hidden);
        }
        out
    }

    fn write_node(&self, out: &mut String, id: TestInstance, include_hidden: bool) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.hidden && !include_hidden {
            return;
        }
        match &node.content {
            NodeContent::Text(text) if node.hidden => {
                let _ = write!(out, "<!--hidden:{text}-->");
            }
            NodeContent::Text(text) => out.push_str(text),
            NodeContent::Element { tag, props } => {
                let _ = write!(out, "<{tag}");
                for (key, value) in props.iter() {
                    let _ = write!(out, " {key}=\"{value}\"");
                }
                if node.hidden {
                    out.push_str(" hidden");
                }
                out.push('>');
                for child in &node.children {
                    self.write_node(out, *child, include_hidden);
                }
                let _ = write!(out, "</{tag}>");
            }
        }
    }
}

impl HostConfig for TestRenderer {
    type Instance = TestInstance;
    type Container = ();

    fn create_instance(&mut self, tag: &str, props: &HostProps) -> TestInstance {
        let id = self.allocate(NodeContent::Element {
            tag: tag.to_string(),
            props: props.clone(),
        });
        self.ops.push(HostOp::Create {
            id,
            tag: tag.to_string(),
        });
        id
    }

    fn create_text_instance(&mut self, text: &str) -> TestInstance {
        let id = self.allocate(NodeContent::Text(text.to_string()));
        self.ops.push(HostOp::CreateText {
            id,
            text: text.to_string(),
        });
        id
    }

    fn append_initial_child(&mut self, parent: &TestInstance, child: &TestInstance) {
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.push(*child);
        }
    }

    fn append_child(&mut self, parent: &TestInstance, child: &TestInstance) {
        self.append(Some(*parent), *child);
    }

    fn insert_before(&mut self, parent: &TestInstance, child: &TestInstance, before: &TestInstance) {
        self.insert(Some(*parent), *child, *before);
    }

    fn remove_child(&mut self, parent: &TestInstance, child: &TestInstance) {
        self.remove(Some(*parent), *child);
    }

    fn append_child_to_container(&mut self, _container: &(), child: &TestInstance) {
        self.append(None, *child);
    }

    fn insert_in_container_before(&mut self, _container: &(), child: &TestInstance, before: &TestInstance) {
        self.insert(None, *child, *before);
    }

    fn remove_child_from_container(&mut self, _container: &(), child: &TestInstance) {
        self.remove(None, *child);
    }

    fn commit_update(&mut self, instance: &TestInstance, _tag: &str, _old_props: &HostProps, new_props: &HostProps) {
        if let Some(Node {
            content: NodeContent::Element { props, .. },
            ..
        }) = self.nodes.get_mut(instance)
        {
            *props = new_props.clone();
        }
        self.ops.push(HostOp::Update { id: *instance });
    }

    fn commit_text_update(&mut self, instance: &TestInstance, _old_text: &str, new_text: &str) {
        if let Some(Node {
            content: NodeContent::Text(text),
            ..
        }) = self.nodes.get_mut(instance)
        {
            *text = new_text.to_string();
        }
        self.ops.push(HostOp::UpdateText {
            id: *instance,
            text: new_text.to_string(),
        });
    }

    fn prepare_for_commit(&mut self, _container: &()) -> Option<TestInstance> {
        self.focused
    }

    fn reset_after_commit(&mut self, _container: &()) {
        self.commits += 1;
    }

    fn clear_container(&mut self, _container: &()) {
        for child in std::mem::take(&mut self.container) {
            self.drop_subtree(child);
        }
        self.ops.push(HostOp::ClearContainer);
    }

    fn hide_instance(&mut self, instance: &TestInstance) {
        if let Some(node) = self.nodes.get_mut(instance) {
            node.hidden = true;
        }
        self.ops.push(HostOp::Hide(*instance));
    }

    fn unhide_instance(&mut self, instance: &TestInstance) {
        if let Some(node) = self.nodes.get_mut(instance) {
            node.hidden = false;
        }
        self.ops.push(HostOp::Unhide(*instance));
    }

    fn before_active_instance_blur(&mut self) {
        self.blurs += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_before_reorders_container_children() {
        let mut host = TestRenderer::default();
        let a = host.create_text_instance("a");
        let b = host.create_text_instance("b");
        host.append_child_to_container(&(), &a);
        host.insert_in_container_before(&(), &b, &a);
        assert_eq!(host.markup(), "ba");
        host.append_child_to_container(&(), &b);
        assert_eq!(host.markup(), "ab");
    }

    #[test]
    fn hidden_nodes_only_show_in_full_markup() {
        let mut host = TestRenderer::default();
        let span = host.create_instance("span", &HostProps::new());
        let text = host.create_text_instance("x");
        host.append_initial_child(&span, &text);
        host.append_child_to_container(&(), &span);
        host.hide_instance(&span);
        assert_eq!(host.markup(), "");
        assert_eq!(host.markup_with_hidden(), "<span hidden>x</span>");
        host.unhide_instance(&span);
        assert_eq!(host.markup(), "<span>x</span>");
    }

    #[test]
    fn removing_a_node_drops_its_subtree_and_focus() {
        let mut host = TestRenderer::default();
        let div = host.create_instance("div", &HostProps::new());
        let text = host.create_text_instance("x");
        host.append_initial_child(&div, &text);
        host.append_child_to_container(&(), &div);
        host.focus(Some(text));
        host.remove_child_from_container(&(), &div);
        assert!(!host.contains(div));
        assert!(!host.contains(text));
        assert_eq!(host.focused(), None);
        assert_eq!(host.markup(), "");
    }
}
