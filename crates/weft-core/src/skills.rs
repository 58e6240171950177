//! Skill workspace - persisted reusable code snippets
//!
//! A workspace holds named skills (orchestration fragments worth keeping),
//! a metadata document per skill, and an intermediate-output store. Saves
//! bump a semantic version and are subject to size quotas.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::defaults;
use crate::error::{Error, Result};

/// Size quotas for one workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillQuotas {
    pub total_bytes: u64,
    pub skill_bytes: u64,
    pub intermediate_bytes: u64,
    pub max_files: usize,
}

impl Default for SkillQuotas {
    fn default() -> Self {
        Self {
            total_bytes: defaults::SKILL_TOTAL_BYTES,
            skill_bytes: defaults::SKILL_MAX_BYTES,
            intermediate_bytes: defaults::INTERMEDIATE_MAX_BYTES,
            max_files: defaults::SKILL_MAX_FILES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SkillVersion {
    fn initial() -> Self {
        Self {
            major: 0,
            minor: 1,
            patch: 0,
        }
    }

    fn bumped(self, bump: VersionBump) -> Self {
        match bump {
            VersionBump::Major => Self {
                major: self.major + 1,
                minor: 0,
                patch: 0,
            },
            VersionBump::Minor => Self {
                minor: self.minor + 1,
                patch: 0,
                ..self
            },
            VersionBump::Patch => Self {
                patch: self.patch + 1,
                ..self
            },
        }
    }
}

impl std::fmt::Display for SkillVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    Major,
    Minor,
    Patch,
}

/// Human-readable metadata document stored beside each skill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMeta {
    pub name: String,
    pub version: SkillVersion,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Filesystem-backed skill workspace
///
/// Layout: `<root>/skills/<name>.code` plus `<name>.meta.json`, and
/// `<root>/intermediate/<name>` for intermediate outputs.
pub struct SkillStore {
    root: PathBuf,
    quotas: SkillQuotas,
}

impl SkillStore {
    pub fn open(root: impl Into<PathBuf>, quotas: SkillQuotas) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("skills"))
            .and_then(|()| std::fs::create_dir_all(root.join("intermediate")))
            .map_err(|e| Error::Internal(format!("cannot create skill workspace: {e}")))?;
        Ok(Self { root, quotas })
    }

    fn code_path(&self, name: &str) -> PathBuf {
        self.root.join("skills").join(format!("{name}.code"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join("skills").join(format!("{name}.meta.json"))
    }

    /// Save a skill, bumping its version when it already exists
    ///
    /// Names are unique per workspace; quota violations fail with
    /// `QuotaExceeded` and leave the previous version in place.
    pub fn save_skill(
        &self,
        name: &str,
        code: &str,
        description: &str,
        bump: VersionBump,
    ) -> Result<SkillMeta> {
        validate_name(name)?;
        if code.len() as u64 > self.quotas.skill_bytes {
            return Err(Error::QuotaExceeded(format!(
                "skill {name} is {} bytes, limit {}",
                code.len(),
                self.quotas.skill_bytes
            )));
        }
        let existing = self.load_meta(name)?;
        self.check_workspace_quota(code.len() as u64, existing.is_none())?;

        let now = chrono::Utc::now();
        let meta = match existing {
            Some(previous) => SkillMeta {
                version: previous.version.bumped(bump),
                description: description.to_string(),
                updated_at: now,
                ..previous
            },
            None => SkillMeta {
                name: name.to_string(),
                version: SkillVersion::initial(),
                description: description.to_string(),
                created_at: now,
                updated_at: now,
            },
        };

        write_file(&self.code_path(name), code.as_bytes())?;
        write_file(
            &self.meta_path(name),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
        )?;
        Ok(meta)
    }

    /// Load a skill's metadata and code
    pub fn load_skill(&self, name: &str) -> Result<(SkillMeta, String)> {
        let meta = self
            .load_meta(name)?
            .ok_or_else(|| Error::NotFound(format!("skill {name}")))?;
        let code = std::fs::read_to_string(self.code_path(name))
            .map_err(|e| Error::Internal(format!("cannot read skill {name}: {e}")))?;
        Ok((meta, code))
    }

    fn load_meta(&self, name: &str) -> Result<Option<SkillMeta>> {
        let path = self.meta_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Internal(format!("cannot read skill metadata: {e}")))?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// All skills in the workspace
    pub fn list_skills(&self) -> Result<Vec<SkillMeta>> {
        let dir = self.root.join("skills");
        let mut skills = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| Error::Internal(format!("cannot list skills: {e}")))?
        {
            let entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match std::fs::read_to_string(&path)
                    .map_err(|e| Error::Internal(e.to_string()))
                    .and_then(|text| serde_json::from_str(&text).map_err(Error::from))
                {
                    Ok(meta) => skills.push(meta),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable skill metadata"),
                }
            }
        }
        skills.sort_by(|a: &SkillMeta, b: &SkillMeta| a.name.cmp(&b.name));
        Ok(skills)
    }

    /// Store an intermediate output blob under `name`
    pub fn save_intermediate(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        validate_name(name)?;
        if bytes.len() as u64 > self.quotas.intermediate_bytes {
            return Err(Error::QuotaExceeded(format!(
                "intermediate {name} is {} bytes, limit {}",
                bytes.len(),
                self.quotas.intermediate_bytes
            )));
        }
        self.check_workspace_quota(bytes.len() as u64, true)?;
        let path = self.root.join("intermediate").join(name);
        write_file(&path, bytes)?;
        Ok(path)
    }

    /// Current (bytes, files) footprint of the workspace
    pub fn usage(&self) -> Result<(u64, usize)> {
        let mut bytes = 0;
        let mut files = 0;
        for dir in ["skills", "intermediate"] {
            let path = self.root.join(dir);
            for entry in std::fs::read_dir(&path)
                .map_err(|e| Error::Internal(format!("cannot stat workspace: {e}")))?
            {
                let entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
                if let Ok(meta) = entry.metadata()
                    && meta.is_file()
                {
                    bytes += meta.len();
                    files += 1;
                }
            }
        }
        Ok((bytes, files))
    }

    fn check_workspace_quota(&self, incoming: u64, new_file: bool) -> Result<()> {
        let (bytes, files) = self.usage()?;
        if bytes + incoming > self.quotas.total_bytes {
            return Err(Error::QuotaExceeded(format!(
                "workspace would hold {} bytes, limit {}",
                bytes + incoming,
                self.quotas.total_bytes
            )));
        }
        if new_file && files + 1 > self.quotas.max_files {
            return Err(Error::QuotaExceeded(format!(
                "workspace holds {files} files, limit {}",
                self.quotas.max_files
            )));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Validation(format!(
            "skill name {name:?} must be non-empty alphanumeric/underscore/dash"
        )));
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| Error::Internal(format!("cannot write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(quotas: SkillQuotas) -> (tempfile::TempDir, SkillStore) {
        let dir = tempdir().unwrap();
        let store = SkillStore::open(dir.path(), quotas).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store(SkillQuotas::default());
        let meta = store
            .save_skill("summarize", "let output = 1;", "Summarize things", VersionBump::Patch)
            .unwrap();
        assert_eq!(meta.version.to_string(), "0.1.0");

        let (loaded, code) = store.load_skill("summarize").unwrap();
        assert_eq!(loaded.name, "summarize");
        assert_eq!(code, "let output = 1;");
    }

    #[test]
    fn test_version_bumps() {
        let (_dir, store) = store(SkillQuotas::default());
        store
            .save_skill("s", "v1", "first", VersionBump::Patch)
            .unwrap();
        let patched = store
            .save_skill("s", "v2", "second", VersionBump::Patch)
            .unwrap();
        assert_eq!(patched.version.to_string(), "0.1.1");
        let minored = store
            .save_skill("s", "v3", "third", VersionBump::Minor)
            .unwrap();
        assert_eq!(minored.version.to_string(), "0.2.0");
        let majored = store
            .save_skill("s", "v4", "fourth", VersionBump::Major)
            .unwrap();
        assert_eq!(majored.version.to_string(), "1.0.0");

        let (_, code) = store.load_skill("s").unwrap();
        assert_eq!(code, "v4");
    }

    #[test]
    fn test_missing_skill_not_found() {
        let (_dir, store) = store(SkillQuotas::default());
        assert!(matches!(
            store.load_skill("ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_per_skill_quota() {
        let (_dir, store) = store(SkillQuotas {
            skill_bytes: 8,
            ..SkillQuotas::default()
        });
        let err = store
            .save_skill("big", "far too much code", "d", VersionBump::Patch)
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[test]
    fn test_total_quota_preserves_existing() {
        let (_dir, store) = store(SkillQuotas {
            total_bytes: 40,
            ..SkillQuotas::default()
        });
        store
            .save_skill("first", "0123456789", "d", VersionBump::Patch)
            .unwrap();
        let err = store
            .save_skill("second", "0123456789012345678901234567890123456789", "d", VersionBump::Patch)
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
        assert!(store.load_skill("first").is_ok());
        assert!(store.load_skill("second").is_err());
    }

    #[test]
    fn test_file_count_quota() {
        let (_dir, store) = store(SkillQuotas {
            max_files: 2,
            ..SkillQuotas::default()
        });
        // One skill occupies two files (code + metadata).
        store
            .save_skill("only", "code", "d", VersionBump::Patch)
            .unwrap();
        let err = store.save_intermediate("blob", b"data").unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[test]
    fn test_intermediate_quota_and_store() {
        let (_dir, store) = store(SkillQuotas {
            intermediate_bytes: 4,
            ..SkillQuotas::default()
        });
        let path = store.save_intermediate("ok", b"1234").unwrap();
        assert!(path.exists());
        assert!(store.save_intermediate("big", b"12345").is_err());
    }

    #[test]
    fn test_list_skills_sorted() {
        let (_dir, store) = store(SkillQuotas::default());
        store.save_skill("zeta", "z", "d", VersionBump::Patch).unwrap();
        store.save_skill("alpha", "a", "d", VersionBump::Patch).unwrap();
        let skills = store.list_skills().unwrap();
        assert_eq!(
            skills.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "zeta"]
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, store) = store(SkillQuotas::default());
        assert!(store.save_skill("", "c", "d", VersionBump::Patch).is_err());
        assert!(
            store
                .save_skill("../escape", "c", "d", VersionBump::Patch)
                .is_err()
        );
    }
}
