// Import necessary libraries and modules for file I/O and serialization.
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};

// Define a structure to hold application settings with serialization and deserialization capabilities.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    pub api_base: String,            // OpenAI-compatible endpoint base URL.
    pub api_key: Option<String>,     // Optional API key for the endpoint.
    pub model: String,               // Chat model used by DM and player agents.
    pub image_model: String,         // Text-to-image model for clue/character art.
    pub image_size: String,          // Requested image dimensions.
    pub data_dir: String,            // Root directory for games, logs and settings.
    pub chapter_cycles: usize,       // Speaking cycles per chapter.
    pub image_request_delay_secs: u64, // Pause between image jobs to respect rate limits.
    pub generate_images: bool,       // Whether new games render assets at all.
    pub default_script_path: Option<String>, // Game directory to load instead of generating.
}

// Implement the Default trait for Settings to provide a method to create default settings.
impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_base: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            api_key: None,
            model: "qwen-plus".to_string(),
            image_model: "wan2.2-t2i-flash".to_string(),
            image_size: "1024*1024".to_string(),
            data_dir: "./data".to_string(),
            chapter_cycles: 3,
            image_request_delay_secs: 3,
            generate_images: true,
            default_script_path: None,
        }
    }
}

// Additional implementation block for Settings.
impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    // Load settings from the default file path, falling back to defaults and
    // then applying environment overrides either way.
    pub fn load() -> Self {
        let mut settings =
            Self::load_settings_from_file("./data/settings.json").unwrap_or_default();
        settings.apply_env();
        settings
    }

    // Save current settings to a default file path.
    pub fn save(&self) -> io::Result<()> {
        std::fs::create_dir_all("./data")?; // Ensure the data directory exists.
        self.save_to_file("./data/settings.json")
    }

    // Load settings from a specified file path.
    pub fn load_settings_from_file(path: &str) -> io::Result<Self> {
        let data = fs::read_to_string(path)?; // Read settings from file.
        let settings = serde_json::from_str(&data)?; // Deserialize JSON data into settings.
        Ok(settings)
    }

    // Save current settings to a specified file path.
    pub fn save_to_file(&self, path: &str) -> io::Result<()> {
        let data = serde_json::to_string_pretty(self)?; // Serialize settings into pretty JSON format.
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)?; // Create the directory if it doesn't exist.
        }
        let mut file = fs::File::create(path)?; // Create or overwrite the file.
        file.write_all(data.as_bytes())?; // Write the serialized data to the file.
        Ok(())
    }

    // Environment variables win over the settings file.
    fn apply_env(&mut self) {
        if let Ok(base) = std::env::var("API_BASE") {
            self.api_base = base;
        }
        if let Ok(key) = std::env::var("API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("MODEL") {
            self.model = model;
        }
        if let Ok(model) = std::env::var("MODEL_T2I") {
            self.image_model = model;
        }
        if let Ok(path) = std::env::var("DEFAULT_SCRIPT_PATH") {
            if !path.is_empty() {
                self.default_script_path = Some(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.model = "qwen-max".to_string();
        settings.chapter_cycles = 5;
        settings.save_to_file(path.to_str().unwrap()).unwrap();

        let loaded = Settings::load_settings_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.model, "qwen-max");
        assert_eq!(loaded.chapter_cycles, 5);
        assert_eq!(loaded.api_base, settings.api_base);
    }
}
