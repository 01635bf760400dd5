//! Dialogue script model and JSON persistence.
//!
//! Scripts are stored as pretty-printed JSON with camelCase keys, which is
//! also the shape the render worker consumes (`characterId` etc.).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to read or write script file: {0}")]
    Io(#[from] std::io::Error),
    #[error("script file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A character that can speak lines in a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    /// Voice preset the worker should use for this character's lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_voice_id: Option<String>,
    /// Directory of character art, relative to the worker's asset root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base_path: Option<PathBuf>,
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            default_voice_id: None,
            image_base_path: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.default_voice_id = Some(voice.into());
        self
    }

    pub fn with_image_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_base_path = Some(path.into());
        self
    }
}

/// One spoken line, in script order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    /// Stable identity for editing; files written before ids existed get a
    /// fresh one per line on load.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub character_id: Uuid,
    pub text: String,
}

impl Line {
    pub fn new(character_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            character_id,
            text: text.into(),
        }
    }
}

/// An authored dialogue script: a cast plus an ordered list of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub lines: Vec<Line>,
}

fn default_title() -> String {
    "Untitled Script".to_string()
}

impl Default for Script {
    fn default() -> Self {
        Self {
            title: default_title(),
            characters: Vec::new(),
            lines: Vec::new(),
        }
    }
}

impl Script {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Look up a cast member by id.
    pub fn character(&self, id: Uuid) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }

    /// Load a script from a JSON file. `Ok(None)` when the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>, ScriptError> {
        let bytes = match tokio::fs::read(path.as_ref()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write the script as pretty-printed JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path.as_ref(), json).await?;
        Ok(())
    }
}

/// Snapshot of a script as submitted to the worker for rendering.
///
/// Constructed fresh per render request and not retained afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub title: String,
    pub characters: Vec<Character>,
    pub lines: Vec<Line>,
}

impl RenderJob {
    pub fn from_script(script: &Script) -> Self {
        Self {
            title: script.title.clone(),
            characters: script.characters.clone(),
            lines: script.lines.clone(),
        }
    }
}

impl From<&Script> for RenderJob {
    fn from(script: &Script) -> Self {
        Self::from_script(script)
    }
}
