//! The generated script: immutable once created, persisted verbatim as
//! `script.json` inside the game directory for the life of a game.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, create_dir_all};
use std::path::Path;

use crate::error::GameError;

pub const SCRIPT_FILE: &str = "script.json";
pub const MANIFEST_FILE: &str = "game_info.json";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Script {
    pub title: String,
    #[serde(default)]
    pub theme: String,
    /// Ordered character names; every per-character map below is keyed by
    /// entries of this list.
    pub characters: Vec<String>,
    /// Per-character ordered chapter texts, one entry per chapter.
    #[serde(default)]
    pub chapters: HashMap<String, Vec<String>>,
    /// DM narration, one entry per chapter. Its length defines the chapter
    /// count of the whole game.
    pub dm: Vec<String>,
    /// Per-chapter clue texts.
    #[serde(default)]
    pub clues: Vec<Vec<String>>,
    /// Per-chapter image prompts, parallel to `clues`.
    #[serde(default)]
    pub clue_image_prompts: Vec<Vec<String>>,
    /// Portrait prompt per character.
    #[serde(default)]
    pub character_image_prompts: HashMap<String, String>,
}

impl Script {
    pub fn total_chapters(&self) -> usize {
        self.dm.len()
    }

    /// The chapter texts a character may see up to and including
    /// `current_chapter` (1-based; 0 means the game has not started and
    /// nothing is visible).
    pub fn visible_chapters(&self, character: &str, current_chapter: usize) -> Vec<String> {
        let Some(chapters) = self.chapters.get(character) else {
            return Vec::new();
        };
        chapters
            .iter()
            .take(current_chapter.min(chapters.len()))
            .cloned()
            .collect()
    }

    pub fn has_character(&self, name: &str) -> bool {
        self.characters.iter().any(|c| c == name)
    }

    /// Invariant checks: the DM narration defines the chapter count, clue
    /// tables must be parallel to it when present, and every chapter map key
    /// must be a known character.
    pub fn validate(&self) -> Result<(), GameError> {
        if self.title.trim().is_empty() {
            return Err(GameError::InvalidScript("missing title".into()));
        }
        if self.characters.is_empty() {
            return Err(GameError::InvalidScript("no characters".into()));
        }
        if self.dm.is_empty() {
            return Err(GameError::InvalidScript("no dm narration".into()));
        }
        if !self.clues.is_empty() && self.clues.len() != self.dm.len() {
            return Err(GameError::InvalidScript(format!(
                "clue table has {} chapters, dm narration has {}",
                self.clues.len(),
                self.dm.len()
            )));
        }
        if !self.clue_image_prompts.is_empty() && self.clue_image_prompts.len() != self.dm.len() {
            return Err(GameError::InvalidScript(format!(
                "clue image prompts cover {} chapters, dm narration has {}",
                self.clue_image_prompts.len(),
                self.dm.len()
            )));
        }
        for name in self.chapters.keys() {
            if !self.has_character(name) {
                return Err(GameError::InvalidScript(format!(
                    "chapter map key '{name}' is not in the character list"
                )));
            }
        }
        for (name, chapters) in &self.chapters {
            if chapters.len() != self.dm.len() {
                log::warn!(
                    "character '{}' has {} chapters, dm narration has {}",
                    name,
                    chapters.len(),
                    self.dm.len()
                );
            }
        }
        Ok(())
    }

    /// Loads a script from `script.json`, validating the required top-level
    /// keys (`title`, `characters`, `dm`) and warning, not failing, on the
    /// absence of optional ones.
    pub fn load(path: &Path) -> Result<Self, GameError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| GameError::InvalidScript(format!("cannot read {}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&data)
            .map_err(|e| GameError::InvalidScript(format!("script is not valid JSON: {e}")))?;

        for key in ["title", "characters", "dm"] {
            if value.get(key).is_none() {
                return Err(GameError::InvalidScript(format!(
                    "script is missing required key '{key}'"
                )));
            }
        }
        for key in ["chapters", "clues", "clue_image_prompts", "character_image_prompts"] {
            if value.get(key).is_none() {
                log::warn!("script is missing optional key '{key}'");
            }
        }

        let script: Script = serde_json::from_value(value)
            .map_err(|e| GameError::InvalidScript(format!("script shape mismatch: {e}")))?;
        script.validate()?;
        Ok(script)
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Per-category asset generation statistics recorded in the manifest.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AssetStats {
    pub total: usize,
    pub succeeded: usize,
}

/// Sidecar of `script.json`: generation statistics plus the deterministic
/// file-naming scheme, so a game directory is self-describing.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GameManifest {
    pub script_title: String,
    pub characters: Vec<String>,
    pub chapters: usize,
    pub character_images: AssetStats,
    pub clue_images: AssetStats,
    pub file_structure: FileStructure,
    pub creation_time: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileStructure {
    pub script: String,
    pub images_dir: String,
    pub character_images: Vec<String>,
    pub clue_images: Vec<String>,
}

impl GameManifest {
    pub fn new(
        script: &Script,
        character_images: AssetStats,
        clue_images: AssetStats,
    ) -> Self {
        let character_files = script
            .characters
            .iter()
            .map(|name| crate::imager::character_image_name(name))
            .collect();
        let clue_files = script
            .clue_image_prompts
            .iter()
            .enumerate()
            .flat_map(|(chapter_idx, prompts)| {
                (1..=prompts.len())
                    .map(move |clue| crate::imager::clue_image_name(chapter_idx + 1, clue))
            })
            .collect();

        Self {
            script_title: script.title.clone(),
            characters: script.characters.clone(),
            chapters: script.total_chapters(),
            character_images,
            clue_images,
            file_structure: FileStructure {
                script: SCRIPT_FILE.to_string(),
                images_dir: "imgs/".to_string(),
                character_images: character_files,
                clue_images: clue_files,
            },
            creation_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn save(&self, game_dir: &Path) -> Result<(), std::io::Error> {
        create_dir_all(game_dir)?;
        let file = File::create(game_dir.join(MANIFEST_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_script() -> Script {
        let mut chapters = HashMap::new();
        chapters.insert(
            "Alice".to_string(),
            vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
        );
        chapters.insert(
            "Bob".to_string(),
            vec!["b1".to_string(), "b2".to_string(), "b3".to_string()],
        );
        Script {
            title: "The Manor Affair".to_string(),
            theme: "country-house murder".to_string(),
            characters: vec!["Alice".to_string(), "Bob".to_string()],
            chapters,
            dm: vec!["dm1".to_string(), "dm2".to_string(), "dm3".to_string()],
            clues: vec![
                vec!["knife".to_string()],
                vec!["letter".to_string(), "footprint".to_string()],
                vec!["will".to_string()],
            ],
            clue_image_prompts: vec![
                vec!["a knife".to_string()],
                vec!["a letter".to_string(), "a footprint".to_string()],
                vec!["a will".to_string()],
            ],
            character_image_prompts: HashMap::from([
                ("Alice".to_string(), "portrait of alice".to_string()),
                ("Bob".to_string(), "portrait of bob".to_string()),
            ]),
        }
    }

    #[test]
    fn validate_accepts_well_formed_script() {
        sample_script().validate().unwrap();
    }

    #[test]
    fn validate_rejects_mismatched_clue_table() {
        let mut script = sample_script();
        script.clues.pop();
        assert!(matches!(
            script.validate(),
            Err(GameError::InvalidScript(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_chapter_key() {
        let mut script = sample_script();
        script
            .chapters
            .insert("Mallory".to_string(), vec!["m1".to_string()]);
        assert!(script.validate().is_err());
    }

    #[test]
    fn visible_chapters_enforces_partial_information() {
        let script = sample_script();
        assert!(script.visible_chapters("Alice", 0).is_empty());
        assert_eq!(script.visible_chapters("Alice", 2), vec!["a1", "a2"]);
        assert_eq!(script.visible_chapters("Alice", 99).len(), 3);
        assert!(script.visible_chapters("Mallory", 2).is_empty());
    }

    #[test]
    fn load_requires_title_characters_dm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCRIPT_FILE);
        std::fs::write(&path, r#"{"title": "t", "characters": ["A"]}"#).unwrap();
        assert!(matches!(
            Script::load(&path),
            Err(GameError::InvalidScript(_))
        ));
    }

    #[test]
    fn load_tolerates_missing_optional_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCRIPT_FILE);
        std::fs::write(
            &path,
            r#"{"title": "t", "characters": ["A"], "dm": ["ch1"]}"#,
        )
        .unwrap();
        let script = Script::load(&path).unwrap();
        assert_eq!(script.total_chapters(), 1);
        assert!(script.clues.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCRIPT_FILE);
        let script = sample_script();
        script.save(&path).unwrap();
        let loaded = Script::load(&path).unwrap();
        assert_eq!(loaded.title, script.title);
        assert_eq!(loaded.dm.len(), loaded.clues.len());
        assert_eq!(loaded.characters, script.characters);
    }

    #[test]
    fn manifest_lists_deterministic_filenames() {
        let script = sample_script();
        let manifest = GameManifest::new(&script, AssetStats::default(), AssetStats::default());
        assert!(manifest
            .file_structure
            .character_images
            .contains(&"Alice.png".to_string()));
        assert!(manifest
            .file_structure
            .clue_images
            .contains(&"clue-ch2-2.png".to_string()));
    }
}
