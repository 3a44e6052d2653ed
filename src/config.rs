use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::calibration::OffsetStore;
use crate::signal::CalibrationOffset;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub smoothing_alpha: f64,
    pub dropout_frames: u32,
    pub velocity_px_s: f64,
    pub dwell_ms: u64,
    pub suppress_ms: u64,
    pub min_paragraph_chars: usize,
    pub min_selection_chars: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.18,
            dropout_frames: 3,
            velocity_px_s: 1200.0,
            dwell_ms: 1500,
            suppress_ms: 800,
            min_paragraph_chars: 25,
            min_selection_chars: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    #[serde(deserialize_with = "deserialize_toggle")]
    pub eye_tracking: bool,
    #[serde(deserialize_with = "deserialize_toggle")]
    pub selection: bool,
    #[serde(deserialize_with = "deserialize_toggle")]
    pub autohide: bool,
    pub autohide_timeout_s: u64,
    #[serde(deserialize_with = "deserialize_toggle")]
    pub pin_default: bool,
    #[serde(deserialize_with = "deserialize_toggle")]
    pub debug: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            eye_tracking: true,
            selection: true,
            autohide: false,
            autohide_timeout_s: 12,
            pin_default: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub url: String,
    pub timeout_ms: u64,
    #[serde(deserialize_with = "deserialize_toggle")]
    pub offline: bool,
}

pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000/api/summarize";

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            timeout_ms: 15_000,
            offline: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopupSettings {
    pub width: f64,
    pub height: f64,
}

impl Default for PopupSettings {
    fn default() -> Self {
        Self {
            width: 200.0,
            height: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub interval_ms: u64,
    pub window_ms: u64,
    pub quota: usize,
    pub settle_ms: u64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            window_ms: 1400,
            quota: 12,
            settle_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default)]
    pub popup: PopupSettings,
    #[serde(default)]
    pub calibration: CalibrationSettings,
}

// --------- tolerant toggle deserializer ----------
// Accepts true/false, "on"/"off"/"yes"/"no"/"true"/"false" and 0/1.
fn deserialize_toggle<'de, D>(de: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let val = toml::Value::deserialize(de)?;
    match val {
        toml::Value::Boolean(b) => Ok(b),
        toml::Value::Integer(i) => Ok(i != 0),
        toml::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "toggle must be a boolean, got '{other}'"
            ))),
        },
        other => Err(serde::de::Error::custom(format!(
            "toggle must be a boolean, got {}",
            other.type_str()
        ))),
    }
}
// ------------------------------------------------------------

pub fn parse_profile(txt: &str) -> Result<Profile> {
    let profile: Profile = toml::from_str(txt)?;
    validate_profile(&profile)?;
    Ok(profile)
}

#[derive(Debug, Clone)]
pub struct ConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub config_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
    Ok(dirs.home_dir().join(".config").join("gazectl"))
}

pub fn state_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("state.json"))
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

impl ConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        Self::load_from(config_dir()?)
    }

    pub fn load_from(cfgdir: PathBuf) -> Result<Self> {
        let profdir = cfgdir.join("profiles");
        fs::create_dir_all(&profdir)?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = match load_profile(&profdir, &active_name) {
            Ok(p) => p,
            Err(e) => {
                warn!("active profile '{active_name}' unusable ({e}); using built-in defaults");
                Profile::default()
            }
        };

        Ok(Self {
            active_name,
            profile,
            config_dir: cfgdir,
            profiles_dir: profdir,
            active_ptr,
        })
    }

    /// Re-read the active profile; on error the last good profile stays.
    pub fn reload(&mut self) -> Result<()> {
        self.profile = load_profile(&self.profiles_dir, &self.active_name)?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let profile = load_profile(&self.profiles_dir, name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    pub fn doctor_report(&self, store: &StateStore) -> serde_json::Value {
        let offset = store.calibration();
        serde_json::json!({
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "state_file": store.path(),
            "state_file_present": store.path().exists(),
            "endpoint": self.profile.endpoint.url,
            "offline_mode": self.profile.endpoint.offline,
            "eye_tracking": self.profile.features.eye_tracking,
            "calibration": { "dx": offset.dx, "dy": offset.dy, "neutral": offset.is_zero() },
            "hints": {
                "gaze_producer": "send {\"x\":..,\"y\":..} datagrams to the UDP listen address",
                "calibrate": "gazectl calibrate (daemon must be running)"
            }
        })
    }
}

fn load_profile(profiles_dir: &Path, name: &str) -> Result<Profile> {
    let path = profiles_dir.join(format!("{name}.toml"));
    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    parse_profile(&txt).map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))
}

fn validate_profile(p: &Profile) -> Result<()> {
    let th = &p.thresholds;
    if !(th.smoothing_alpha > 0.0 && th.smoothing_alpha <= 1.0) {
        return Err(anyhow!("thresholds.smoothing_alpha must be in (0,1]"));
    }
    if th.dwell_ms == 0 || th.dropout_frames == 0 {
        return Err(anyhow!("thresholds.dwell_ms and dropout_frames must be positive"));
    }
    if !(th.velocity_px_s.is_finite() && th.velocity_px_s > 0.0) {
        return Err(anyhow!("thresholds.velocity_px_s must be a positive number"));
    }
    if p.endpoint.url.trim().is_empty() && !p.endpoint.offline {
        return Err(anyhow!("endpoint.url is empty and offline mode is off"));
    }
    if p.popup.width <= 0.0 || p.popup.height <= 0.0 {
        return Err(anyhow!("popup.width and popup.height must be positive"));
    }
    let cal = &p.calibration;
    if cal.interval_ms == 0 || cal.window_ms == 0 || cal.quota == 0 {
        return Err(anyhow!("calibration timing values must be positive"));
    }
    Ok(())
}

// --------- persisted key -> value record ----------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state store encoding: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinnedPopup {
    pub pinned: bool,
    pub left: f64,
    pub top: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: u64,
    pub text: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateRecord {
    #[serde(default)]
    calibration: Option<CalibrationOffset>,
    #[serde(default)]
    pinned_popup: Option<PinnedPopup>,
    #[serde(default)]
    notes: Vec<Note>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    record: StateRecord,
}

impl StateStore {
    /// Missing or unreadable files yield an empty record.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(txt) => serde_json::from_str(&txt).unwrap_or_else(|e| {
                warn!("ignoring unreadable state file {}: {e}", path.display());
                StateRecord::default()
            }),
            Err(_) => StateRecord::default(),
        };
        Self { path, record }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn calibration(&self) -> CalibrationOffset {
        self.record
            .calibration
            .map(CalibrationOffset::sanitized)
            .unwrap_or_default()
    }

    pub fn set_calibration(&mut self, offset: CalibrationOffset) -> Result<(), StoreError> {
        self.record.calibration = Some(offset.sanitized());
        self.save()
    }

    pub fn pinned_popup(&self) -> Option<PinnedPopup> {
        self.record.pinned_popup.filter(|p| p.pinned)
    }

    pub fn set_pinned_popup(&mut self, pin: Option<PinnedPopup>) -> Result<(), StoreError> {
        self.record.pinned_popup = pin;
        self.save()
    }

    pub fn notes(&self) -> &[Note] {
        &self.record.notes
    }

    /// Newest first.
    pub fn add_note(&mut self, note: Note) -> Result<(), StoreError> {
        self.record.notes.insert(0, note);
        self.save()
    }

    fn save(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let body = serde_json::to_string_pretty(&self.record)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl OffsetStore for StateStore {
    fn load_offset(&self) -> CalibrationOffset {
        self.calibration()
    }

    fn save_offset(&mut self, offset: CalibrationOffset) -> Result<(), StoreError> {
        self.set_calibration(offset)
    }
}
