use std::fs;
use std::path::{Path, PathBuf};

use nugget_core::config::RetrievalSettings;
use walkdir::WalkDir;

use crate::errors::{RetrievalError, RetrievalResult};

pub const BRAIN_YAML: &str = "brain.yaml";
pub const DOMAINS_DIR: &str = "domains";
pub const CACHE_DIR: &str = ".nugget";
pub const INDEX_DB: &str = "index.sqlite3";

const BRAIN_YAML_CONTENT: &str = "version: 1\n";
const GITIGNORE_CONTENT: &str = ".nugget/\n";

pub fn brain_root(settings: &RetrievalSettings) -> RetrievalResult<PathBuf> {
    settings
        .brain_root
        .clone()
        .ok_or(RetrievalError::MissingBrainRoot)
}

pub fn domains_root(brain_root: &Path) -> PathBuf {
    brain_root.join(DOMAINS_DIR)
}

pub fn index_db_path(settings: &RetrievalSettings) -> RetrievalResult<PathBuf> {
    if let Some(path) = &settings.cache_path_override {
        return Ok(path.clone());
    }
    Ok(brain_root(settings)?.join(CACHE_DIR).join(INDEX_DB))
}

/// Create the brain skeleton. Existing files are left alone.
pub fn init_brain(path: &Path) -> RetrievalResult<()> {
    fs::create_dir_all(domains_root(path))?;

    let brain_yaml = path.join(BRAIN_YAML);
    if !brain_yaml.exists() {
        fs::write(&brain_yaml, BRAIN_YAML_CONTENT)?;
    }

    let gitignore = path.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, GITIGNORE_CONTENT)?;
    }
    Ok(())
}

/// Markdown files under `domains/`, sorted by path.
pub fn walk_document_files(brain_root: &Path) -> Vec<PathBuf> {
    let root = domains_root(brain_root);
    if !root.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(&root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_document_path(path))
        .collect();
    files.sort();
    files
}

pub fn is_document_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "md")
        && !path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'))
}
