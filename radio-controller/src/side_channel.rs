/**
 * SIDE-CHANNEL - Fichiers d'échange avec l'extérieur
 *
 * RÔLE :
 * - getter : snapshot complet des variables observées, réécrit à chaque réponse
 *   get_parameters (écriture tmp + rename, jamais de fichier à moitié écrit)
 * - setter : {node: {attr: valeur}} déposé par un outil externe, consommé à
 *   chaque tick. Le fichier est "claim" par rename avant lecture, puis un `{}`
 *   est recréé seulement si aucun writer n'a déjà reposé un fichier.
 */

use crate::config::SideChannelConf;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

pub type SetterBatch = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum SideChannelError {
    #[error("setter file {0:?} not found")]
    Missing(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SideChannel {
    getter_path: PathBuf,
    setter_path: PathBuf,
}

impl SideChannel {
    pub fn new(conf: &SideChannelConf) -> Self {
        Self {
            getter_path: conf.getter_path.clone(),
            setter_path: conf.setter_path.clone(),
        }
    }

    pub fn getter_path(&self) -> &Path {
        &self.getter_path
    }

    pub fn setter_path(&self) -> &Path {
        &self.setter_path
    }

    /// Réécrit entièrement le fichier getter.
    pub fn persist_observed(&self, values: &BTreeMap<String, Value>) -> Result<(), SideChannelError> {
        let json = serde_json::to_vec_pretty(values)?;
        write_atomic(&self.getter_path, &json)?;
        Ok(())
    }

    /// Prend les requêtes setter en attente et laisse un mapping vide derrière,
    /// même si le contenu pris était invalide.
    pub fn take_setters(&self) -> Result<SetterBatch, SideChannelError> {
        let claim = claim_path(&self.setter_path);
        match fs::rename(&self.setter_path, &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SideChannelError::Missing(self.setter_path.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        reset_empty(&self.setter_path)?;

        let content = consume_claim(&claim)?;

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(SetterBatch::new());
        }
        Ok(serde_json::from_slice(&content)?)
    }
}

fn claim_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "setter".into());
    path.with_file_name(format!(".{}.{}.claim", file_name, Uuid::new_v4()))
}

/// Lit puis supprime le fichier claim ; un échec de suppression est loggé.
fn consume_claim(claim: &Path) -> io::Result<Vec<u8>> {
    let content = fs::read(claim);
    if let Err(e) = fs::remove_file(claim) {
        warn!(path = %claim.display(), error = %e, "claimed setter file left behind");
    }
    content
}

/// `{}` uniquement si personne n'a recréé le fichier entre temps.
fn reset_empty(path: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => file.write_all(b"{}"),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "getter".into());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}
