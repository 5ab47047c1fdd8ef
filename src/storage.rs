//! Adaptateur de persistance.
//!
//! Lit et écrit des documents JSON et des fichiers texte par nom logique
//! (`downloads.json`, `blocklists/easylist.txt`, ...) sous un dossier de
//! données unique. Aucune logique métier ici.
//!
//! Un nom logique est toujours relatif : les noms absolus ou contenant `..`
//! sont refusés avant tout accès disque, pour qu'un nom venant d'un message
//! ne puisse pas sortir du dossier de données.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{PolicyError, Result};

/// Stockage fichier enraciné dans le dossier de données de l'application.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Résout un nom logique en chemin absolu sous la racine.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let is_plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(PolicyError::InvalidName(name.to_owned()));
        }
        Ok(self.root.join(relative))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_ok_and(|p| p.is_file())
    }

    /// Lit un document JSON. `Ok(None)` si le fichier n'existe pas.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(content) = self.read_text(name)? else {
            return Ok(None);
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PolicyError::json(name, e))
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string(value).map_err(|e| PolicyError::json(name, e))?;
        self.write_text(name, &content)
    }

    /// Lit un fichier texte. `Ok(None)` si le fichier n'existe pas.
    pub fn read_text(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PolicyError::io(path.display().to_string(), e)),
        }
    }

    /// Écrit un fichier en créant les dossiers parents au besoin.
    pub fn write_text(&self, name: &str, content: &str) -> Result<()> {
        self.write_bytes(name, content.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, content: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PolicyError::io(parent.display().to_string(), e))?;
        }
        fs::write(&path, content).map_err(|e| PolicyError::io(path.display().to_string(), e))?;
        debug!(path = %path.display(), bytes = content.len(), "Fichier écrit");
        Ok(())
    }

    /// Supprime un fichier. Un fichier déjà absent n'est pas une erreur.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PolicyError::io(path.display().to_string(), e)),
        }
    }

    /// Liste les fichiers d'un sous-dossier portant l'extension donnée,
    /// triés par nom, sous forme de noms logiques (`dir/file.ext`).
    pub fn list(&self, dir: &str, extension: &str) -> Result<Vec<String>> {
        let path = self.path(dir)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PolicyError::io(path.display().to_string(), e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == extension))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_owned))
            .map(|file| format!("{dir}/{file}"))
            .collect();
        names.sort();
        Ok(names)
    }
}
