// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Firmware blob store: a directory tree of `<project>/<file>` under one
//! root, with strict name validation on every client-supplied component.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareFile {
    pub name: String,
    pub size: u64,
    pub modified_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareProject {
    pub project: String,
    pub files: Vec<FirmwareFile>,
}

pub struct FirmwareStore {
    root: PathBuf,
}

impl FirmwareStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject anything that could escape the store: separators, `..`,
    /// empty or hidden names.
    pub fn sanitize(name: &str) -> Result<&str, ApiError> {
        if name.is_empty() {
            return Err(ApiError::bad_request("empty name"));
        }
        if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('\0')
        {
            return Err(ApiError::bad_request(format!("invalid name: {name:?}")));
        }
        if name.starts_with('.') {
            return Err(ApiError::bad_request(format!("invalid name: {name:?}")));
        }
        Ok(name)
    }

    fn entry_path(&self, project: &str, file: &str) -> Result<PathBuf, ApiError> {
        let project = Self::sanitize(project)?;
        let file = Self::sanitize(file)?;
        Ok(self.root.join(project).join(file))
    }

    /// Store one uploaded blob, replacing any previous version.
    pub async fn save(&self, project: &str, file: &str, data: &[u8]) -> Result<u64, ApiError> {
        let path = self.entry_path(project, file)?;
        let parent = path.parent().ok_or_else(|| ApiError::internal("no parent dir"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::internal(format!("mkdir: {e}")))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| ApiError::internal(format!("write: {e}")))?;
        Ok(data.len() as u64)
    }

    /// List all projects and their files.
    pub async fn list(&self) -> Result<Vec<FirmwareProject>, ApiError> {
        let mut projects = Vec::new();
        let mut root = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(projects),
        };
        while let Ok(Some(entry)) = root.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let project = entry.file_name().to_string_lossy().into_owned();
            let mut files = Vec::new();
            let Ok(mut dir) = tokio::fs::read_dir(entry.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = dir.next_entry().await {
                let Ok(meta) = file.metadata().await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let modified_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                files.push(FirmwareFile {
                    name: file.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                    modified_ms,
                });
            }
            files.sort_by(|a, b| a.name.cmp(&b.name));
            projects.push(FirmwareProject { project, files });
        }
        projects.sort_by(|a, b| a.project.cmp(&b.project));
        Ok(projects)
    }

    /// Delete one file, or a whole project when `file` is `None`.
    pub async fn delete(&self, project: &str, file: Option<&str>) -> Result<(), ApiError> {
        match file {
            Some(file) => {
                let path = self.entry_path(project, file)?;
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|_| ApiError::not_found(format!("{project}/{file}")))
            }
            None => {
                let project = Self::sanitize(project)?;
                let path = self.root.join(project);
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|_| ApiError::not_found(project))
            }
        }
    }

    /// Read a blob for download.
    pub async fn read(&self, project: &str, file: &str) -> Result<Vec<u8>, ApiError> {
        let path = self.entry_path(project, file)?;
        tokio::fs::read(&path)
            .await
            .map_err(|_| ApiError::not_found(format!("{project}/{file}")))
    }
}

#[cfg(test)]
#[path = "firmware_tests.rs"]
mod tests;
