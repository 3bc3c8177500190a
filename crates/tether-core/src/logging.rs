//! Logging and debugging facilities.
//!
//! Tether reports through the `tracing` crate and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("tether_core::signal=trace,tether_core=debug")
//!         .init();
//! }
//! ```
//!
//! Use [`ObjectTreeDebug`] to render the ownership tree:
//!
//! ```
//! use tether_core::Runtime;
//! use tether_core::logging::ObjectTreeDebug;
//!
//! let rt = Runtime::new();
//! let root = rt.create_plain(None).unwrap();
//! rt.set_object_name(root, "window");
//! println!("{}", ObjectTreeDebug::new(&rt));
//! ```

use std::fmt::{self, Write as FmtWrite};

use crate::object::ObjectId;
use crate::runtime::Runtime;

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core framework target.
    pub const CORE: &str = "tether_core";
    /// Type registry and meta-object target.
    pub const META: &str = "tether_core::meta";
    /// Object lifecycle and tree target.
    pub const OBJECT: &str = "tether_core::object";
    /// Connection and emission target.
    pub const SIGNAL: &str = "tether_core::signal";
    /// Event queue and dispatcher target.
    pub const EVENT: &str = "tether_core::event";
    /// Timer target.
    pub const TIMER: &str = "tether_core::timer";
    /// Worker pool target.
    pub const THREADPOOL: &str = "tether_core::threadpool";
    /// Runtime and thread lifecycle target.
    pub const RUNTIME: &str = "tether_core::runtime";
}

/// Style options for object tree visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// ASCII characters for tree branches.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
    /// Compact single-line representation.
    Compact,
}

/// Configuration for object tree debug output.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    /// The style of tree visualization.
    pub style: TreeStyle,
    /// Whether to show object IDs.
    pub show_ids: bool,
    /// Whether to show class names.
    pub show_types: bool,
    /// Whether to show the owning thread.
    pub show_thread: bool,
    /// Whether to show outgoing/incoming connection counts.
    pub show_connections: bool,
    /// Whether to show dynamic property names.
    pub show_properties: bool,
    /// Maximum depth to traverse (None for unlimited).
    pub max_depth: Option<usize>,
    /// Indent size for each level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_ids: true,
            show_types: true,
            show_thread: false,
            show_connections: false,
            show_properties: false,
            max_depth: None,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Create options for detailed debugging output.
    pub fn detailed() -> Self {
        Self {
            show_thread: true,
            show_connections: true,
            show_properties: true,
            ..Default::default()
        }
    }

    /// Create options for minimal output.
    pub fn minimal() -> Self {
        Self {
            show_ids: false,
            show_types: false,
            ..Default::default()
        }
    }
}

/// Renders a runtime's object hierarchy.
///
/// Each node is read separately, so a tree that is mutated concurrently may
/// render a mix of old and new state.
#[derive(Debug, Clone)]
pub struct ObjectTreeDebug {
    runtime: Runtime,
    options: TreeFormatOptions,
}

impl ObjectTreeDebug {
    /// Create a visualizer with default options.
    pub fn new(runtime: &Runtime) -> Self {
        Self::with_options(runtime, TreeFormatOptions::default())
    }

    /// Create a visualizer with custom options.
    pub fn with_options(runtime: &Runtime, options: TreeFormatOptions) -> Self {
        Self {
            runtime: runtime.clone(),
            options,
        }
    }

    /// Format every tree, starting from the root objects.
    pub fn format_all(&self) -> String {
        let roots = self.runtime.root_objects();
        let mut output = String::new();
        let _ = writeln!(
            output,
            "Object Tree ({} total objects):",
            self.runtime.object_count()
        );
        if roots.is_empty() {
            output.push_str("  (empty)\n");
        }
        for root in roots {
            self.format_node(root, 0, true, &mut output);
        }
        output
    }

    /// Format the subtree rooted at `root`. Empty if `root` is gone.
    pub fn format_subtree(&self, root: ObjectId) -> String {
        let mut output = String::new();
        self.format_node(root, 0, true, &mut output);
        output
    }

    fn format_node(&self, id: ObjectId, depth: usize, is_last: bool, output: &mut String) {
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return;
        }
        let Some(name) = self.runtime.object_name(id) else {
            return;
        };
        let rt = &self.runtime;

        output.push_str(&self.build_prefix(depth, is_last));
        output.push_str(if name.is_empty() { "(unnamed)" } else { &name });
        if self.options.show_ids {
            let _ = write!(output, " [{id:?}]");
        }
        if self.options.show_types {
            if let Some(meta) = rt.meta_object_of(id) {
                let _ = write!(output, " ({})", meta.class_name);
            }
        }
        if self.options.show_thread {
            if let Some(thread) = rt.thread_of(id) {
                match thread.name() {
                    Some(name) => {
                        let _ = write!(output, " @{name}");
                    }
                    None => {
                        let _ = write!(output, " @{:?}", thread.id());
                    }
                }
            }
        }
        if self.options.show_connections {
            let (outgoing, incoming) = rt.connection_counts(id);
            let _ = write!(output, " <out {outgoing}, in {incoming}>");
        }
        output.push('\n');

        if self.options.show_properties {
            let prefix = self.build_property_prefix(depth);
            for property in rt.dynamic_property_names(id) {
                let _ = writeln!(output, "{prefix}  .{property}");
            }
        }

        let children = rt.children(id);
        let count = children.len();
        for (i, child) in children.into_iter().enumerate() {
            self.format_node(child, depth + 1, i + 1 == count, output);
        }
    }

    fn build_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }
        let (branch, tee, corner) = match self.options.style {
            TreeStyle::Ascii => ("|", "+-- ", "`-- "),
            TreeStyle::Unicode => ("\u{2502}", "\u{251c}\u{2500}\u{2500} ", "\u{2514}\u{2500}\u{2500} "),
            TreeStyle::Compact => ("", "- ", "- "),
        };
        let mut prefix = String::new();
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            prefix.extend(std::iter::repeat_n(' ', self.options.indent_size));
        }
        prefix.push_str(if is_last { corner } else { tee });
        prefix
    }

    fn build_property_prefix(&self, depth: usize) -> String {
        let branch = match self.options.style {
            TreeStyle::Ascii => "|",
            TreeStyle::Unicode => "\u{2502}",
            TreeStyle::Compact => "",
        };
        let mut prefix = String::new();
        for _ in 0..depth {
            prefix.push_str(branch);
            prefix.extend(std::iter::repeat_n(' ', self.options.indent_size));
        }
        prefix
    }
}

impl fmt::Display for ObjectTreeDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;
    use crate::meta::{DELETE_LATER_SLOT, DESTROYED_SIGNAL};

    fn named(rt: &Runtime, name: &str, parent: Option<ObjectId>) -> ObjectId {
        let id = rt.create_plain(parent).unwrap();
        rt.set_object_name(id, name);
        id
    }

    #[test]
    fn test_tree_format_empty() {
        let rt = Runtime::new();
        let output = ObjectTreeDebug::new(&rt).format_all();
        assert!(output.contains("Object Tree (0 total objects)"));
        assert!(output.contains("(empty)"));
    }

    #[test]
    fn test_tree_format_single() {
        let rt = Runtime::new();
        let root = named(&rt, "root", None);
        let output = ObjectTreeDebug::new(&rt).format_subtree(root);
        assert!(output.contains("root"));
        assert!(output.contains("(Object)"));
    }

    #[test]
    fn test_tree_format_hierarchy() {
        let rt = Runtime::new();
        let root = named(&rt, "window", None);
        named(&rt, "button1", Some(root));
        named(&rt, "button2", Some(root));

        let options = TreeFormatOptions {
            style: TreeStyle::Ascii,
            ..TreeFormatOptions::minimal()
        };
        let output = ObjectTreeDebug::with_options(&rt, options).format_subtree(root);
        assert_eq!(output, "window\n+-- button1\n`-- button2\n");
    }

    #[test]
    fn test_tree_format_minimal() {
        let rt = Runtime::new();
        let root = named(&rt, "test", None);
        let output = ObjectTreeDebug::with_options(&rt, TreeFormatOptions::minimal()).format_subtree(root);
        assert!(output.contains("test"));
        assert!(!output.contains("(Object)"));
        assert!(!output.contains('['));
    }

    #[test]
    fn test_tree_format_detailed() {
        let rt = Runtime::new();
        let a = named(&rt, "a", None);
        let b = named(&rt, "b", None);
        rt.connect(a, DESTROYED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Direct)
            .unwrap();
        rt.set_dynamic_property(a, "color", String::from("red")).unwrap();

        let output = ObjectTreeDebug::with_options(&rt, TreeFormatOptions::detailed()).format_subtree(a);
        assert!(output.contains("<out 1, in 0>"));
        assert!(output.contains(".color"));
        assert!(output.contains(" @"));
    }

    #[test]
    fn test_tree_max_depth() {
        let rt = Runtime::new();
        let root = named(&rt, "root", None);
        let child = named(&rt, "child", Some(root));
        named(&rt, "grandchild", Some(child));

        let options = TreeFormatOptions {
            max_depth: Some(1),
            ..TreeFormatOptions::minimal()
        };
        let output = ObjectTreeDebug::with_options(&rt, options).format_subtree(root);
        assert!(output.contains("child"));
        assert!(!output.contains("grandchild"));
    }
}
