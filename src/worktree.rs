//! Working-tree operations over git2.
//!
//! The engine needs four things from the checkout: prove it is a real
//! repository (resume validation), put it on the work branch (setup),
//! summarize what changed relative to the base branch (publish safeguard
//! and progress display), and commit the accumulated work (publish).

use anyhow::{Context, Result, anyhow};
use git2::{BranchType, Delta, DiffOptions, Repository, Signature};
use std::path::{Path, PathBuf};

/// Changes in the working tree (plus index) relative to the base branch.
#[derive(Debug, Clone, Default)]
pub struct ChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.files_added.is_empty()
            && self.files_modified.is_empty()
            && self.files_deleted.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }
}

pub struct Worktree {
    repo: Repository,
    root: PathBuf,
}

impl Worktree {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("{} is not a git checkout", path.display()))?;
        Ok(Self {
            repo,
            root: path.to_path_buf(),
        })
    }

    /// Cheap validation used by the resume path.
    pub fn is_checkout(path: &Path) -> bool {
        path.exists() && Repository::open(path).is_ok()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head().context("Failed to read HEAD")?;
        head.shorthand()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("HEAD is not on a branch"))
    }

    /// Create (or re-enter) the work branch off the base branch and
    /// check it out. Re-entering matters for resume after a crash
    /// between branch creation and the setup stage completing.
    pub fn checkout_work_branch(&self, branch: &str, base: &str) -> Result<()> {
        if self.repo.find_branch(branch, BranchType::Local).is_err() {
            let base_branch = self
                .repo
                .find_branch(base, BranchType::Local)
                .with_context(|| format!("Base branch '{base}' not found"))?;
            let base_commit = base_branch
                .get()
                .peel_to_commit()
                .with_context(|| format!("Base branch '{base}' has no commit"))?;
            self.repo
                .branch(branch, &base_commit, false)
                .with_context(|| format!("Failed to create branch '{branch}'"))?;
        }
        self.repo
            .set_head(&format!("refs/heads/{branch}"))
            .with_context(|| format!("Failed to switch HEAD to '{branch}'"))?;
        self.repo
            .checkout_head(Some(git2::build::CheckoutBuilder::default().safe()))
            .context("Failed to check out work branch")?;
        Ok(())
    }

    /// Diff the base branch's tree against the working directory plus
    /// index, untracked files included.
    pub fn changes_since_base(&self, base: &str) -> Result<ChangeSummary> {
        let base_branch = self
            .repo
            .find_branch(base, BranchType::Local)
            .with_context(|| format!("Base branch '{base}' not found"))?;
        let base_tree = base_branch
            .get()
            .peel_to_commit()
            .context("Base branch has no commit")?
            .tree()
            .context("Failed to read base tree")?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
            .context("Failed to diff against base")?;

        let mut summary = ChangeSummary::default();
        diff.foreach(
            &mut |delta, _progress| {
                if let Some(path) = delta.new_file().path() {
                    let path = path.to_path_buf();
                    match delta.status() {
                        Delta::Added | Delta::Untracked => summary.files_added.push(path),
                        Delta::Modified => summary.files_modified.push(path),
                        Delta::Deleted => summary.files_deleted.push(path),
                        _ => {}
                    }
                }
                true
            },
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => summary.lines_added += 1,
                    '-' => summary.lines_removed += 1,
                    _ => {}
                }
                true
            }),
        )
        .context("Failed to walk diff")?;

        Ok(summary)
    }

    /// Uncommitted changes present, untracked files included.
    pub fn is_dirty(&self) -> Result<bool> {
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read worktree status")?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything and commit. Returns the new commit's SHA.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index().context("Failed to open index")?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .context("Failed to stage changes")?;
        index.write().context("Failed to write index")?;

        let tree_id = index.write_tree().context("Failed to write tree")?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("conveyor", "conveyor@localhost")?;

        let parents: Vec<git2::Commit<'_>> = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .context("Failed to create commit")?;
        Ok(commit_id.to_string())
    }

    pub fn head_sha(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .map(|c| c.id().to_string())
    }
}

/// Turn an issue reference into a branch-safe slug:
/// `owner/repo#123` → `owner-repo-123`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Work-branch name for an issue reference.
pub fn branch_for_issue(issue_ref: &str) -> String {
    format!("conveyor/{}", slugify(issue_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (Worktree, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        drop(repo);
        commit_file(dir.path(), "README.md", "hello\n", "init");
        let tree = Worktree::open(dir.path()).unwrap();
        (tree, dir)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn test_open_rejects_non_repository() {
        let dir = tempdir().unwrap();
        assert!(Worktree::open(dir.path()).is_err());
        assert!(!Worktree::is_checkout(dir.path()));
        assert!(!Worktree::is_checkout(Path::new("/nonexistent/path")));
    }

    #[test]
    fn test_is_checkout_accepts_repository() {
        let (_tree, dir) = setup_repo();
        assert!(Worktree::is_checkout(dir.path()));
    }

    #[test]
    fn test_checkout_work_branch_creates_and_switches() {
        let (tree, _dir) = setup_repo();
        let base = tree.current_branch().unwrap();
        tree.checkout_work_branch("conveyor/issue-1", &base).unwrap();
        assert_eq!(tree.current_branch().unwrap(), "conveyor/issue-1");
    }

    #[test]
    fn test_checkout_work_branch_is_reentrant() {
        let (tree, _dir) = setup_repo();
        let base = tree.current_branch().unwrap();
        tree.checkout_work_branch("conveyor/issue-1", &base).unwrap();
        // crash-resume path re-runs setup; the existing branch is reused
        tree.checkout_work_branch("conveyor/issue-1", &base).unwrap();
        assert_eq!(tree.current_branch().unwrap(), "conveyor/issue-1");
    }

    #[test]
    fn test_checkout_work_branch_requires_base() {
        let (tree, _dir) = setup_repo();
        let err = tree
            .checkout_work_branch("conveyor/x", "does-not-exist")
            .unwrap_err();
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn test_changes_since_base_empty_on_fresh_branch() {
        let (tree, _dir) = setup_repo();
        let base = tree.current_branch().unwrap();
        tree.checkout_work_branch("conveyor/issue-2", &base).unwrap();
        let summary = tree.changes_since_base(&base).unwrap();
        assert!(summary.is_empty());
        assert_eq!(summary.file_count(), 0);
    }

    #[test]
    fn test_changes_since_base_sees_new_and_modified_files() {
        let (tree, dir) = setup_repo();
        let base = tree.current_branch().unwrap();
        tree.checkout_work_branch("conveyor/issue-3", &base).unwrap();

        fs::write(dir.path().join("new.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("README.md"), "hello\nmore\n").unwrap();

        let summary = tree.changes_since_base(&base).unwrap();
        assert!(summary.files_added.iter().any(|p| p.ends_with("new.rs")));
        assert!(
            summary
                .files_modified
                .iter()
                .any(|p| p.ends_with("README.md"))
        );
        assert!(!summary.is_empty());
    }

    #[test]
    fn test_committed_work_still_differs_from_base() {
        let (tree, dir) = setup_repo();
        let base = tree.current_branch().unwrap();
        tree.checkout_work_branch("conveyor/issue-4", &base).unwrap();

        fs::write(dir.path().join("feature.rs"), "pub fn f() {}\n").unwrap();
        assert!(tree.is_dirty().unwrap());
        let sha = tree.commit_all("add feature").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(tree.head_sha().unwrap(), sha);
        assert!(!tree.is_dirty().unwrap());

        // the publish safeguard compares trees, so committed work counts
        let summary = tree.changes_since_base(&base).unwrap();
        assert!(summary.files_added.iter().any(|p| p.ends_with("feature.rs")));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("owner/repo#123"), "owner-repo-123");
        assert_eq!(slugify("Fix the THING"), "fix-the-thing");
        assert_eq!(slugify("--already--dashed--"), "already-dashed");
        assert_eq!(slugify("#42"), "42");
    }

    #[test]
    fn test_branch_for_issue() {
        assert_eq!(branch_for_issue("acme/widgets#7"), "conveyor/acme-widgets-7");
    }
}
