//! Authoritative daemon configuration, including the bearer token. A daemon
//! started from a token-less config generates one and persists it back.

use std::path::PathBuf;

use companion_core::config::ConfigFile;
use companion_core::ids::generate_token;

use crate::{DebouncedFile, StoreError};

#[derive(Clone)]
pub struct ConfigStore {
    file: DebouncedFile<ConfigFile>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: DebouncedFile::new(path, false),
        }
    }

    pub async fn load(&self) -> ConfigFile {
        self.file.read(|config| config.clone()).await
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut ConfigFile) -> R) -> R {
        self.file.mutate(f).await
    }

    /// The configured token, generating and persisting a fresh one when the
    /// config file carries none.
    pub async fn ensure_token(&self) -> Result<String, StoreError> {
        let (token, generated) = self
            .file
            .mutate(|config| match &config.token {
                Some(token) if !token.is_empty() => (token.clone(), false),
                _ => {
                    let token = generate_token();
                    config.token = Some(token.clone());
                    (token, true)
                }
            })
            .await;
        if generated {
            self.file.flush().await?;
        }
        Ok(token)
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.file.flush().await
    }
}
