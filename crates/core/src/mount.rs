//! Mount description projection
//!
//! Derives the filesystem description handed to a sandbox from a [`FileTree`].
//! The shape matches what in-browser sandboxes expect:
//!
//! ```json
//! {
//!   "package.json": { "file": { "contents": "{}" } },
//!   "src": { "directory": { "app.ts": { "file": { "contents": "x" } } } }
//! }
//! ```
//!
//! The project root's children are the top-level keys; there is no wrapping
//! directory for the root itself.
//!
//! Before projection, [`ensure_scaffold`] injects a minimal manifest and
//! markup entry when the generated tree lacks them.

use crate::file_tree::{normalize_path, FileNode, FileTree, NodeKind};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

/// File name of the package manifest
pub const MANIFEST_NAME: &str = "package.json";

/// File name of the root markup bootstrap
pub const MARKUP_NAME: &str = "index.html";

/// Manifest synthesized when the generated project has none
pub const SCAFFOLD_MANIFEST: &str = r#"{
  "name": "vite-react-typescript-starter",
  "private": true,
  "version": "0.0.0",
  "type": "module",
  "scripts": {
    "dev": "vite",
    "build": "vite build",
    "lint": "eslint .",
    "preview": "vite preview"
  },
  "dependencies": {
    "react": "^18.3.1",
    "react-dom": "^18.3.1",
    "react-router-dom": "^6.22.3",
    "lucide-react": "^0.344.0"
  },
  "devDependencies": {
    "@types/react": "^18.3.5",
    "@types/react-dom": "^18.3.0",
    "@vitejs/plugin-react": "^4.3.1",
    "typescript": "^5.5.3",
    "vite": "^5.4.2",
    "tailwindcss": "^3.4.1",
    "autoprefixer": "^10.4.18",
    "postcss": "^8.4.35"
  }
}"#;

/// Markup bootstrap synthesized when the generated project has none
pub const SCAFFOLD_MARKUP: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <link rel="icon" type="image/svg+xml" href="/vite.svg" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Vite + React + TS</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>"#;

/// Contents of a file entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub contents: String,
}

/// One entry of a mount description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountNode {
    Directory {
        directory: IndexMap<String, MountNode>,
    },
    File {
        file: FileContents,
    },
}

impl MountNode {
    pub fn file(contents: impl Into<String>) -> Self {
        MountNode::File {
            file: FileContents {
                contents: contents.into(),
            },
        }
    }

    /// Child entries, `None` for files
    pub fn as_directory(&self) -> Option<&IndexMap<String, MountNode>> {
        match self {
            MountNode::Directory { directory } => Some(directory),
            MountNode::File { .. } => None,
        }
    }

    /// File contents, `None` for directories
    pub fn contents(&self) -> Option<&str> {
        match self {
            MountNode::File { file } => Some(&file.contents),
            MountNode::Directory { .. } => None,
        }
    }
}

/// Mountable description of a whole project, keyed by root entry name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountDescription(pub IndexMap<String, MountNode>);

impl MountDescription {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&MountNode> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MountNode)> {
        self.0.iter()
    }

    /// Resolve a `/`-separated path relative to the project root
    pub fn lookup(&self, path: &str) -> Option<&MountNode> {
        let mut segments = normalize_path(path).into_iter().filter(|s| *s != ".");
        let first = segments.next()?;
        let mut node = self.0.get(first)?;
        for segment in segments {
            node = node.as_directory()?.get(segment)?;
        }
        Some(node)
    }

    /// Stable sha256 digest of names, kinds and contents, in order
    pub fn fingerprint(&self) -> String {
        fn feed(hasher: &mut Sha256, entries: &IndexMap<String, MountNode>) {
            for (name, node) in entries {
                match node {
                    MountNode::Directory { directory } => {
                        hasher.update(b"d\0");
                        hasher.update(name.as_bytes());
                        hasher.update(b"\0");
                        feed(hasher, directory);
                        hasher.update(b"\x03");
                    }
                    MountNode::File { file } => {
                        hasher.update(b"f\0");
                        hasher.update(name.as_bytes());
                        hasher.update(b"\0");
                        hasher.update(file.contents.len().to_le_bytes());
                        hasher.update(file.contents.as_bytes());
                    }
                }
            }
        }

        let mut hasher = Sha256::new();
        feed(&mut hasher, &self.0);
        format!("{:x}", hasher.finalize())
    }
}

/// Where a required entry may appear for it to count as present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryScope {
    /// Only a root-level entry counts
    RootOnly,
    /// A root-level entry or one nested at any depth counts
    Anywhere,
}

/// A root artifact that must exist before mounting, with its fallback content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredEntry {
    pub name: String,
    pub scope: EntryScope,
    pub scaffold: String,
}

impl RequiredEntry {
    /// The package manifest; a nested manifest suppresses the scaffold
    pub fn manifest() -> Self {
        Self {
            name: MANIFEST_NAME.to_string(),
            scope: EntryScope::Anywhere,
            scaffold: SCAFFOLD_MANIFEST.to_string(),
        }
    }

    /// The root markup bootstrap
    pub fn markup() -> Self {
        Self {
            name: MARKUP_NAME.to_string(),
            scope: EntryScope::RootOnly,
            scaffold: SCAFFOLD_MARKUP.to_string(),
        }
    }

    pub fn is_present(&self, tree: &FileTree) -> bool {
        match self.scope {
            EntryScope::RootOnly => tree.has_root_entry(&self.name),
            EntryScope::Anywhere => {
                tree.has_root_entry(&self.name) || tree.contains_named(&self.name)
            }
        }
    }

    fn scaffold_node(&self) -> FileNode {
        FileNode::file(self.name.clone(), self.name.clone(), self.scaffold.clone())
    }
}

/// Prepend the entry's scaffold file when the tree lacks it
pub fn ensure_required_entry(tree: &FileTree, entry: &RequiredEntry) -> FileTree {
    ensure_required_entry_with(tree, |t| entry.is_present(t), entry.scaffold_node())
}

/// Prepend `scaffold` when `present` reports the artifact missing
pub fn ensure_required_entry_with<P>(tree: &FileTree, present: P, scaffold: FileNode) -> FileTree
where
    P: Fn(&FileTree) -> bool,
{
    if present(tree) {
        return tree.clone();
    }

    warn!("{} not found in files, creating default {}", scaffold.name, scaffold.name);
    let mut roots = Vec::with_capacity(tree.roots.len() + 1);
    roots.push(scaffold);
    roots.extend(tree.roots.iter().cloned());
    FileTree { roots }
}

/// Apply the built-in required entries.
///
/// The markup is ensured first and the manifest last, so a synthesized
/// manifest always ends up as the first root entry.
pub fn ensure_scaffold(tree: &FileTree) -> FileTree {
    let with_markup = ensure_required_entry(tree, &RequiredEntry::markup());
    ensure_required_entry(&with_markup, &RequiredEntry::manifest())
}

/// Project a tree into a mount description
#[instrument(skip_all, fields(roots = tree.roots.len()))]
pub fn project(tree: &FileTree) -> MountDescription {
    let mut root = IndexMap::with_capacity(tree.roots.len());
    project_into(&mut root, &tree.roots);
    debug!("Projected {} root entries", root.len());
    MountDescription(root)
}

fn project_into(target: &mut IndexMap<String, MountNode>, nodes: &[FileNode]) {
    for node in nodes {
        let entry = match &node.kind {
            NodeKind::File { content } => MountNode::file(content.clone()),
            NodeKind::Folder { children } => {
                let mut directory = IndexMap::with_capacity(children.len());
                project_into(&mut directory, children);
                MountNode::Directory { directory }
            }
        };
        if target.insert(node.name.clone(), entry).is_some() {
            warn!(
                "Duplicate entry '{}' in mount projection; later entry wins",
                node.path
            );
        }
    }
}
