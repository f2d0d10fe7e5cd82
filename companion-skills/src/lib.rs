//! Skill-bundle extraction: a named bundle of text files written under a
//! per-skill directory. Validation rejects anything that could place a file
//! outside that directory or balloon the tree.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tracing::info;

pub const MAX_FILES: usize = 50;
pub const MAX_FILE_BYTES: usize = 100_000;
pub const MAX_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid skill name: {0}")]
    InvalidName(String),

    #[error("invalid skill bundle: {0}")]
    InvalidBundle(String),

    #[error("skill not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillBundle {
    pub name: String,
    pub files: Vec<SkillFile>,
}

/// Validate a bundle without touching the filesystem. Rules: a sane skill
/// name; ≤50 files; per-file relative paths with no parent traversal,
/// backslashes or control characters; depth ≤4; content ≤100,000 bytes.
pub fn validate_bundle(bundle: &SkillBundle) -> Result<(), SkillError> {
    validate_name(&bundle.name)?;
    if bundle.files.is_empty() {
        return Err(SkillError::InvalidBundle("bundle has no files".into()));
    }
    if bundle.files.len() > MAX_FILES {
        return Err(SkillError::InvalidBundle(format!(
            "bundle has {} files, limit is {MAX_FILES}",
            bundle.files.len()
        )));
    }
    for file in &bundle.files {
        validate_relative_path(&file.path)?;
        if file.content.len() > MAX_FILE_BYTES {
            return Err(SkillError::InvalidBundle(format!(
                "file '{}' is {} bytes, limit is {MAX_FILE_BYTES}",
                file.path,
                file.content.len()
            )));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), SkillError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > 100 {
        return Err(SkillError::InvalidName(name.to_string()));
    }
    let ok = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || trimmed.starts_with('.') {
        return Err(SkillError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_relative_path(raw: &str) -> Result<(), SkillError> {
    if raw.trim().is_empty() {
        return Err(SkillError::InvalidBundle("empty file path".into()));
    }
    if raw.contains('\\') {
        return Err(SkillError::InvalidBundle(format!(
            "backslashes are not allowed: {raw}"
        )));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(SkillError::InvalidBundle(format!(
            "control characters are not allowed: {raw:?}"
        )));
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(SkillError::InvalidBundle(format!(
            "absolute paths are not allowed: {raw}"
        )));
    }
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SkillError::InvalidBundle(format!(
                    "path traversal is not allowed: {raw}"
                )));
            }
        }
    }
    if depth == 0 {
        return Err(SkillError::InvalidBundle(format!("empty file path: {raw}")));
    }
    if depth > MAX_DEPTH {
        return Err(SkillError::InvalidBundle(format!(
            "path '{raw}' is {depth} levels deep, limit is {MAX_DEPTH}"
        )));
    }
    Ok(())
}

/// Validate and write a bundle under `skills_root/<name>/`, replacing any
/// previous extraction of the same skill. Returns the files written.
pub async fn extract_bundle(
    skills_root: &Path,
    bundle: &SkillBundle,
) -> Result<Vec<PathBuf>, SkillError> {
    validate_bundle(bundle)?;
    let skill_dir = skills_root.join(bundle.name.trim());
    if tokio::fs::metadata(&skill_dir).await.is_ok() {
        tokio::fs::remove_dir_all(&skill_dir).await?;
    }
    tokio::fs::create_dir_all(&skill_dir).await?;

    let mut written = Vec::with_capacity(bundle.files.len());
    for file in &bundle.files {
        let target = skill_dir.join(&file.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.content).await?;
        written.push(target);
    }
    info!(skill = %bundle.name, files = written.len(), "skill bundle extracted");
    Ok(written)
}

/// Remove an extracted skill by name.
pub async fn delete_skill(skills_root: &Path, name: &str) -> Result<(), SkillError> {
    validate_name(name)?;
    let skill_dir = skills_root.join(name.trim());
    match tokio::fs::remove_dir_all(&skill_dir).await {
        Ok(()) => {
            info!(skill = %name, "skill deleted");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(SkillError::NotFound(name.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(name: &str, files: Vec<(&str, &str)>) -> SkillBundle {
        SkillBundle {
            name: name.into(),
            files: files
                .into_iter()
                .map(|(path, content)| SkillFile {
                    path: path.into(),
                    content: content.into(),
                })
                .collect(),
        }
    }

    #[test]
    fn rejects_absolute_parent_backslash_and_control_paths() {
        for bad in ["/etc/passwd", "../escape.md", "a\\b.md", "a\u{7}.md"] {
            let err = validate_bundle(&bundle("skill", vec![(bad, "x")])).unwrap_err();
            assert!(
                matches!(err, SkillError::InvalidBundle(_)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_deep_trees_large_files_and_oversized_bundles() {
        let err = validate_bundle(&bundle("skill", vec![("a/b/c/d/e.md", "x")])).unwrap_err();
        assert!(matches!(err, SkillError::InvalidBundle(_)));

        let big = "x".repeat(MAX_FILE_BYTES + 1);
        let err = validate_bundle(&SkillBundle {
            name: "skill".into(),
            files: vec![SkillFile {
                path: "big.md".into(),
                content: big,
            }],
        })
        .unwrap_err();
        assert!(matches!(err, SkillError::InvalidBundle(_)));

        let many: Vec<(String, String)> = (0..(MAX_FILES + 1))
            .map(|i| (format!("f{i}.md"), "x".to_string()))
            .collect();
        let err = validate_bundle(&SkillBundle {
            name: "skill".into(),
            files: many
                .iter()
                .map(|(p, c)| SkillFile {
                    path: p.clone(),
                    content: c.clone(),
                })
                .collect(),
        })
        .unwrap_err();
        assert!(matches!(err, SkillError::InvalidBundle(_)));
    }

    #[test]
    fn rejects_bad_skill_names() {
        for bad in ["", "  ", "../x", "a/b", ".hidden"] {
            let err = validate_bundle(&bundle(bad, vec![("a.md", "x")])).unwrap_err();
            assert!(
                matches!(err, SkillError::InvalidName(_)),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn extract_writes_and_replaces_then_delete_removes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("skills");

        let written = extract_bundle(
            &root,
            &bundle(
                "notes",
                vec![("SKILL.md", "# notes"), ("ref/guide.md", "body")],
            ),
        )
        .await
        .expect("extract");
        assert_eq!(written.len(), 2);
        assert_eq!(
            std::fs::read_to_string(root.join("notes/SKILL.md")).expect("read"),
            "# notes"
        );

        // Re-extraction replaces the previous tree.
        extract_bundle(&root, &bundle("notes", vec![("SKILL.md", "v2")]))
            .await
            .expect("re-extract");
        assert!(!root.join("notes/ref/guide.md").exists());
        assert_eq!(
            std::fs::read_to_string(root.join("notes/SKILL.md")).expect("read"),
            "v2"
        );

        delete_skill(&root, "notes").await.expect("delete");
        assert!(!root.join("notes").exists());

        let err = delete_skill(&root, "notes").await.unwrap_err();
        assert!(matches!(err, SkillError::NotFound(_)));
    }
}
