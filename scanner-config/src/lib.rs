// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! File-backed configuration shared by the scanner crates.
//!
//! Files ending in `.yaml` / `.yml` are read and written as YAML, everything
//! else as JSON.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing yaml config {}", path.display()))?,
            ConfigFormat::Json => serde_json::from_str(&content)
                .with_context(|| format!("parsing json config {}", path.display()))?,
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }
}

/// A config value paired with the file it was loaded from.
pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
