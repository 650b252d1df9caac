//! Run configuration management
//!
//! Configurations live in a TOML file: user entries by name, per-filetype
//! defaults, and engine settings shared by every session.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use debugger::{ConnectionOptions, DEFAULT_DIAL_ATTEMPTS, RunSpec};
use eyre::{OptionExt, WrapErr};
use serde::Deserialize;

/// Choosing a configuration by name, or listing what there is to choose from
#[derive(Debug)]
pub enum ChosenConfig<'a> {
    /// The named configuration exists
    Specific(&'a Config),
    /// The named configuration was not found
    NotFound,
    /// No name was given, so present the available ones
    ToBeChosen(Vec<String>),
}

/// How to reach an adapter, and the arguments for its `launch` or `attach`
/// request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub run: RunSpec,
    #[serde(default = "empty_object")]
    pub launch: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Config {
    /// `"attach"` or `"launch"`, from the `request` key of the launch
    /// arguments. Defaults to `"launch"`.
    pub fn request(&self) -> &str {
        self.launch
            .get("request")
            .and_then(|r| r.as_str())
            .unwrap_or("launch")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub accept_timeout_secs: Option<u64>,
    pub dial_attempts: usize,
    pub max_message_size: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            accept_timeout_secs: None,
            dial_attempts: DEFAULT_DIAL_ATTEMPTS,
            max_message_size: None,
        }
    }
}

impl EngineSettings {
    /// Connection options carrying these settings. Subscribers and the
    /// reverse request handler are left at their defaults.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            accept_timeout: self.accept_timeout_secs.map(Duration::from_secs),
            dial_attempts: self.dial_attempts.max(1),
            max_message_size: self.max_message_size,
            ..ConnectionOptions::default()
        }
    }
}

impl From<&EngineSettings> for ConnectionOptions {
    fn from(settings: &EngineSettings) -> Self {
        settings.connection_options()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Configs {
    /// Per-filetype defaults: filetype, then configuration name.
    pub defaults: HashMap<String, HashMap<String, Config>>,
    pub user: HashMap<String, Config>,
    pub engine: EngineSettings,
}

impl Configs {
    /// Look up a configuration, preferring the user's over the filetype's
    /// defaults.
    pub fn get(&self, filetype: &str, name: &str) -> Option<&Config> {
        self.user.get(name).or_else(|| {
            self.defaults
                .get(filetype)
                .and_then(|configs| configs.get(name))
        })
    }

    /// Names usable for `filetype`, sorted and without duplicates.
    pub fn available(&self, filetype: &str) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .user
            .keys()
            .chain(self.defaults.get(filetype).into_iter().flat_map(|c| c.keys()))
            .collect();
        names.into_iter().cloned().collect()
    }

    pub fn choose(&self, filetype: &str, name: Option<&str>) -> ChosenConfig<'_> {
        match name {
            Some(name) => match self.get(filetype, name) {
                Some(config) => ChosenConfig::Specific(config),
                None => ChosenConfig::NotFound,
            },
            None => ChosenConfig::ToBeChosen(self.available(filetype)),
        }
    }
}

pub fn from_str(contents: &str) -> eyre::Result<Configs> {
    toml::from_str(contents).wrap_err("parsing configuration")
}

pub fn load(mut r: impl std::io::Read) -> eyre::Result<Configs> {
    let mut contents = String::new();
    r.read_to_string(&mut contents)
        .wrap_err("reading configuration contents")?;
    from_str(&contents)
}

pub fn load_from_path(path: impl AsRef<Path>) -> eyre::Result<Configs> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "loading configuration");
    let f = std::fs::File::open(path).wrap_err("opening configuration path")?;
    load(f).wrap_err_with(|| format!("loading configuration from {}", path.display()))
}

/// `<config dir>/dap-console/config.toml`
pub fn default_path() -> eyre::Result<PathBuf> {
    let dir = dirs::config_dir().ok_or_eyre("cannot determine configuration directory")?;
    Ok(dir.join("dap-console").join("config.toml"))
}

/// Load the default configuration file. A missing file gives empty
/// configuration.
pub fn load_default() -> eyre::Result<Configs> {
    let path = default_path()?;
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(Configs::default());
    }
    load_from_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_valid() {
        let configs = from_str("").unwrap();
        assert!(configs.user.is_empty());
        assert_eq!(configs.engine, EngineSettings::default());
    }

    #[test]
    fn launch_defaults_to_empty_object() {
        let configs = from_str(
            r#"
            [user.remote]
            run = { kind = "remote", address = "127.0.0.1:5678" }
            "#,
        )
        .unwrap();
        let config = configs.get("python", "remote").unwrap();
        assert_eq!(config.launch, serde_json::json!({}));
        assert_eq!(config.request(), "launch");
    }

    #[test]
    fn engine_settings_become_connection_options() {
        let settings = EngineSettings {
            accept_timeout_secs: Some(3),
            dial_attempts: 0,
            max_message_size: Some(1024),
        };
        let options = ConnectionOptions::from(&settings);
        assert_eq!(options.accept_timeout, Some(Duration::from_secs(3)));
        assert_eq!(options.dial_attempts, 1);
        assert_eq!(options.max_message_size, Some(1024));
        assert!(options.subscribers.is_empty());
    }

    #[test]
    fn unknown_run_kind_is_rejected() {
        let err = from_str(
            r#"
            [user.bad]
            run = { kind = "telepathy" }
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:?}").contains("parsing configuration"));
    }
}
