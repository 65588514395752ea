use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;

use forge_types::{ApplyError, FileOperation, OperationResult};

/// Applies an ordered operation list to a project tree. Operations run strictly in
/// order and every operation gets exactly one result; a failure never stops the rest.
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    async fn apply(&self, operations: &[FileOperation]) -> Vec<OperationResult>;

    /// Current project contents rendered as prompt context.
    fn snapshot(&self) -> String {
        String::new()
    }
}

/// Normalizes a model-supplied path to a `/`-separated relative path.
pub fn normalize_path(raw: &str) -> Result<String, ApplyError> {
    let trimmed = raw.trim();
    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || unified.chars().nth(1) == Some(':') {
        return Err(ApplyError::InvalidPath(raw.to_string()));
    }
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(ApplyError::InvalidPath(raw.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(ApplyError::InvalidPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}

fn is_within(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        to.to_string()
    } else {
        format!("{to}{}", &path[from.len()..])
    }
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(idx, _)| &path[..idx])
}

/// Source-to-destination pairs left by earlier moves, applied in move order.
#[derive(Debug, Clone, Default)]
pub struct MoveRedirects {
    moves: Vec<(String, String)>,
}

impl MoveRedirects {
    pub fn record(&mut self, source: &str, destination: &str) {
        self.moves.push((source.to_string(), destination.to_string()));
    }

    /// Where a write aimed at `path` should land now.
    pub fn resolve(&self, path: &str) -> String {
        self.moves
            .iter()
            .fold(path.to_string(), |current, (from, to)| {
                if is_within(&current, from) {
                    rebase(&current, from, to)
                } else {
                    current
                }
            })
    }
}

#[derive(Debug, Default)]
struct ProjectTree {
    files: BTreeMap<String, String>,
    folders: BTreeSet<String>,
    redirects: MoveRedirects,
}

impl ProjectTree {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.folders.contains(path)
    }

    fn check_parents(&self, path: &str) -> Result<(), ApplyError> {
        match ancestors(path).find(|ancestor| self.files.contains_key(*ancestor)) {
            Some(file) => Err(ApplyError::NotAFolder(file.to_string())),
            None => Ok(()),
        }
    }

    fn create_parents(&mut self, path: &str) {
        let parents = ancestors(path).map(str::to_string).collect::<Vec<_>>();
        self.folders.extend(parents);
    }

    fn apply_one(&mut self, operation: &FileOperation) -> Result<Option<String>, ApplyError> {
        match operation {
            FileOperation::WriteFile {
                path,
                content,
                exact_path,
            } => {
                let normalized = normalize_path(path)?;
                let target = if *exact_path {
                    normalized
                } else {
                    self.redirects.resolve(&normalized)
                };
                if self.folders.contains(&target) {
                    return Err(ApplyError::InvalidPath(target));
                }
                self.check_parents(&target)?;
                self.create_parents(&target);
                self.files.insert(target.clone(), content.clone());
                Ok(Some(target))
            }
            FileOperation::CreateFolder { path } => {
                let target = normalize_path(path)?;
                if self.files.contains_key(&target) {
                    return Err(ApplyError::DestinationExists(target));
                }
                self.check_parents(&target)?;
                self.create_parents(&target);
                self.folders.insert(target.clone());
                Ok(Some(target))
            }
            FileOperation::Move {
                source,
                destination,
            } => {
                let source = normalize_path(source)?;
                let destination = normalize_path(destination)?;
                if !self.exists(&source) {
                    return Err(ApplyError::NotFound(source));
                }
                if self.exists(&destination) {
                    return Err(ApplyError::DestinationExists(destination));
                }
                if is_within(&destination, &source) {
                    return Err(ApplyError::InvalidPath(destination));
                }
                self.check_parents(&destination)?;
                self.create_parents(&destination);

                let moved_files = self
                    .files
                    .keys()
                    .filter(|p| is_within(p, &source))
                    .cloned()
                    .collect::<Vec<_>>();
                for old in moved_files {
                    if let Some(content) = self.files.remove(&old) {
                        self.files.insert(rebase(&old, &source, &destination), content);
                    }
                }
                let moved_folders = self
                    .folders
                    .iter()
                    .filter(|p| is_within(p, &source))
                    .cloned()
                    .collect::<Vec<_>>();
                for old in moved_folders {
                    self.folders.remove(&old);
                    self.folders.insert(rebase(&old, &source, &destination));
                }

                self.redirects.record(&source, &destination);
                Ok(Some(destination))
            }
            FileOperation::Delete { path } => {
                let target = normalize_path(path)?;
                if !self.exists(&target) {
                    return Err(ApplyError::NotFound(target));
                }
                self.files.retain(|p, _| !is_within(p, &target));
                self.folders.retain(|p| !is_within(p, &target));
                Ok(Some(target))
            }
        }
    }
}

/// In-memory project tree keyed by normalized relative paths.
#[derive(Debug, Default)]
pub struct VirtualProject {
    tree: Mutex<ProjectTree>,
}

impl VirtualProject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let mut tree = ProjectTree::default();
        for (path, content) in files {
            if let Ok(path) = normalize_path(path.as_ref()) {
                tree.create_parents(&path);
                tree.files.insert(path, content.into());
            }
        }
        Self {
            tree: Mutex::new(tree),
        }
    }

    /// Loads every file under `root` (UTF-8 only; other files are skipped).
    pub async fn load_dir(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let mut tree = ProjectTree::default();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(relative) = relative_key(root, &path) else {
                    continue;
                };
                if relative.split('/').any(|part| part.starts_with('.')) {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    tree.folders.insert(relative);
                    pending.push(path);
                } else if file_type.is_file() {
                    match fs::read_to_string(&path).await {
                        Ok(content) => {
                            tree.files.insert(relative, content);
                        }
                        Err(err) => {
                            tracing::debug!(path = %path.display(), error = %err, "skipping unreadable file");
                        }
                    }
                }
            }
        }
        Ok(Self {
            tree: Mutex::new(tree),
        })
    }

    /// Writes the current tree under `root`, replacing files that changed and removing
    /// files that no longer exist in the tree.
    pub async fn write_dir(&self, root: impl AsRef<Path>) -> anyhow::Result<()> {
        let root = root.as_ref();
        let (files, folders) = {
            let tree = self.lock();
            (tree.files.clone(), tree.folders.clone())
        };
        let on_disk = Self::load_dir(root).await?;
        let stale = on_disk
            .file_paths()
            .into_iter()
            .filter(|p| !files.contains_key(p))
            .collect::<Vec<_>>();
        for path in stale {
            fs::remove_file(root.join(&path)).await?;
        }
        for folder in &folders {
            fs::create_dir_all(root.join(folder)).await?;
        }
        for (path, content) in &files {
            let target: PathBuf = root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, content).await?;
        }
        Ok(())
    }

    pub fn read(&self, path: &str) -> Option<String> {
        let path = normalize_path(path).ok()?;
        self.lock().files.get(&path).cloned()
    }

    pub fn is_folder(&self, path: &str) -> bool {
        normalize_path(path)
            .map(|p| self.lock().folders.contains(&p))
            .unwrap_or(false)
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Renders the tree as `--- START OF <path> ---` blocks for prompt context.
    pub fn render_context(&self) -> String {
        let tree = self.lock();
        let mut out = String::new();
        for (path, content) in &tree.files {
            out.push_str(&format!("--- START OF {path} ---\n{content}\n--- END OF {path} ---\n"));
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProjectTree> {
        self.tree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[async_trait]
impl ChangeApplier for VirtualProject {
    async fn apply(&self, operations: &[FileOperation]) -> Vec<OperationResult> {
        let mut tree = self.lock();
        operations
            .iter()
            .map(|operation| match tree.apply_one(operation) {
                Ok(resolved) => OperationResult::ok(operation.clone(), resolved),
                Err(error) => {
                    tracing::debug!(operation = %operation.describe(), error = %error, "operation failed");
                    OperationResult::failed(operation.clone(), error)
                }
            })
            .collect()
    }

    fn snapshot(&self) -> String {
        self.render_context()
    }
}
