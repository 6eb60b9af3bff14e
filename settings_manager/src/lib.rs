//! Configuration management for talky
//!
//! This crate handles loading, saving and accessing application
//! configuration, plus the client identity that must survive restarts.

use config::{Config, Environment, File, FileFormat};
use log::{debug, info, warn};
use room_core::{ClientId, Error, Timings, Topology};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the user's config dir that holds our files
pub const APP_DIR: &str = "talky";
/// Prefix of environment variables overriding settings, e.g. `TALKY_STALE_MS`
pub const ENV_PREFIX: &str = "TALKY";

const CONFIG_FILE: &str = "config.toml";
const IDENTITY_FILE: &str = "client_id";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Room layout used for new rooms
    pub topology: Topology,

    /// Room capacity, derived from the topology when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<usize>,

    pub heartbeat_ms: u64,
    pub stale_ms: u64,
    pub ptt_lease_ms: u64,
    pub ptt_refresh_ms: u64,
    pub offer_debounce_ms: u64,
    pub busy_message_ms: u64,

    /// List of STUN/TURN servers for WebRTC connectivity
    pub ice_servers: Vec<String>,

    /// Base of shareable room links
    pub share_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        let timings = Timings::default();
        Self {
            topology: Topology::TwoParty,
            max_participants: None,
            heartbeat_ms: timings.heartbeat.as_millis() as u64,
            stale_ms: timings.stale_ms,
            ptt_lease_ms: timings.ptt_lease_ms,
            ptt_refresh_ms: timings.ptt_refresh.as_millis() as u64,
            offer_debounce_ms: timings.offer_debounce.as_millis() as u64,
            busy_message_ms: timings.busy_message.as_millis() as u64,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            share_base_url: "https://talky.app".to_string(),
        }
    }
}

impl Settings {
    pub fn max_participants(&self) -> usize {
        self.max_participants
            .unwrap_or_else(|| self.topology.default_max_participants())
    }

    pub fn timings(&self) -> Timings {
        Timings {
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            stale_ms: self.stale_ms,
            ptt_lease_ms: self.ptt_lease_ms,
            ptt_refresh: Duration::from_millis(self.ptt_refresh_ms),
            offer_debounce: Duration::from_millis(self.offer_debounce_ms),
            busy_message: Duration::from_millis(self.busy_message_ms),
        }
    }

    /// Reject settings under which presence or the PTT lease cannot work.
    pub fn validate(&self) -> Result<(), Error> {
        if self.heartbeat_ms == 0 || self.ptt_refresh_ms == 0 {
            return Err(Error::Validation(
                "heartbeat_ms and ptt_refresh_ms must be positive".to_string(),
            ));
        }
        if self.stale_ms <= self.heartbeat_ms {
            return Err(Error::Validation(format!(
                "stale_ms ({}) must exceed heartbeat_ms ({})",
                self.stale_ms, self.heartbeat_ms
            )));
        }
        if self.ptt_refresh_ms >= self.ptt_lease_ms {
            return Err(Error::Validation(format!(
                "ptt_refresh_ms ({}) must be shorter than ptt_lease_ms ({})",
                self.ptt_refresh_ms, self.ptt_lease_ms
            )));
        }

        let max = self.max_participants();
        let limit = self.topology.default_max_participants();
        if max < 2 || max > limit {
            return Err(Error::Validation(format!(
                "max_participants {} is not possible for a {:?} room",
                max, self.topology
            )));
        }

        let is_ice_url = |url: &String| {
            ["stun:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
        };
        if let Some(bad) = self.ice_servers.iter().find(|url| !is_ice_url(url)) {
            return Err(Error::Validation(format!("Invalid ICE server URL: {}", bad)));
        }
        if !self.share_base_url.starts_with("http://") && !self.share_base_url.starts_with("https://")
        {
            return Err(Error::Validation(format!(
                "share_base_url must be an http(s) URL, got {:?}",
                self.share_base_url
            )));
        }
        Ok(())
    }
}

/// Per-user directory holding the config file and the identity
pub fn app_dir() -> Result<PathBuf, Error> {
    let mut dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
    dir.push(APP_DIR);
    Ok(dir)
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load `{config_dir}/talky/config.toml`, environment overrides on top
    pub fn new() -> Result<Self, Error> {
        Self::with_file(app_dir()?.join(CONFIG_FILE))
    }

    /// Create a new ConfigManager with a custom file path
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::load(path.as_ref(), ENV_PREFIX)
    }

    fn load(config_file: &Path, env_prefix: &str) -> Result<Self, Error> {
        if !config_file.exists() {
            debug!("Config file {:?} not found, using defaults", config_file);
        }
        let settings: Settings = Config::builder()
            .add_source(File::from(config_file).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ice_servers"),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load settings: {}", e)))?;
        settings.validate()?;

        Ok(Self {
            settings,
            config_file: config_file.to_path_buf(),
        })
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        self.settings.validate()?;
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}

/// Locally persisted client identity
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Identity file in `{config_dir}/talky`
    pub fn new() -> Result<Self, Error> {
        Ok(Self::in_dir(app_dir()?))
    }

    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join(IDENTITY_FILE),
        }
    }

    /// The stored id, or a fresh one when missing or too short. A fresh id
    /// is still returned when it cannot be persisted.
    pub fn load_or_create(&self) -> ClientId {
        if let Ok(raw) = fs::read_to_string(&self.path) {
            if let Some(id) = ClientId::parse(&raw) {
                return id;
            }
            warn!("Stored client id in {:?} is invalid, replacing it", self.path);
        }

        let id = ClientId::new();
        if let Err(e) = self.persist(&id) {
            warn!("Could not persist client id: {}", e);
        } else {
            info!("Created client id {}", id);
        }
        id
    }

    fn persist(&self, id: &ClientId) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, id.as_str())?;
        Ok(())
    }
}
