//! Configuration management.
//!
//! # Agent configuration
//!
//! The agent is configured with a single TOML file, in the same declarative
//! shape as the original measurement agent this crate is modelled on: a
//! `[agent]` section of global settings, a top-level `tags` table of
//! default tags, and `[[inputs.<name>]]` / `[[outputs.<name>]]` arrays of
//! tables, one per enabled plugin instance.
//!
//! ```toml
//! [agent]
//! interval = "10s"
//! flush_interval = "10s"
//!
//! [tags]
//! region = "eu-west"
//!
//! [[inputs.mem]]
//! name_prefix = "sys_"
//!
//! [[outputs.file]]
//! files = ["stdout"]
//! ```
//!
//! # Loading the configuration
//!
//! Use [`Loader`] to read the file, apply `${VAR}` environment-variable
//! substitution, merge in any CLI overrides, and parse the result into a
//! [`RawConfig`]. Use [`Registry`] together with [`build`] to turn a
//! [`RawConfig`] into a runnable [`crate::agent::Agent`]: the registry maps
//! each `inputs.<name>` / `outputs.<name>` key to a constructor for the
//! compiled-in plugin of that name (there is no `dlopen`-style dynamic
//! plugin loading; see `SPEC_FULL.md` §1 Non-goals).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::env::VarError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::input::InputConfig;
use crate::output::OutputConfig;

use error::*;

/// `[agent]` section: global settings shared by the whole pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub round_interval: bool,
    #[serde(with = "humantime_serde::option")]
    pub precision: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub collection_jitter: Duration,
    #[serde(with = "humantime_serde")]
    pub flush_jitter: Duration,
    pub metric_batch_size: usize,
    pub metric_buffer_limit: usize,
    pub quiet: bool,
    pub logtarget: String,
    pub logfile: Option<String>,
    #[serde(with = "humantime_serde::option")]
    pub logfile_rotation_interval: Option<Duration>,
    pub logfile_rotation_max_size: Option<byte_unit::Byte>,
    pub logfile_rotation_max_archives: Option<usize>,
    pub hostname: Option<String>,
    pub omit_hostname: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            interval: Duration::from_secs(10),
            round_interval: true,
            precision: None,
            flush_interval: Duration::from_secs(10),
            collection_jitter: Duration::ZERO,
            flush_jitter: Duration::ZERO,
            metric_batch_size: crate::output::DEFAULT_METRIC_BATCH_SIZE,
            metric_buffer_limit: crate::output::DEFAULT_METRIC_BUFFER_LIMIT,
            quiet: false,
            logtarget: "stderr".to_string(),
            logfile: None,
            logfile_rotation_interval: None,
            logfile_rotation_max_size: None,
            logfile_rotation_max_archives: None,
            hostname: None,
            omit_hostname: false,
        }
    }
}

/// The parsed, but not yet built, configuration: general agent settings
/// plus one raw TOML table per configured input/output instance. The
/// per-plugin tables are not deserialized into their final types here,
/// since that depends on which plugin the name refers to; see [`build`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    #[serde(alias = "global_tags")]
    pub tags: BTreeMap<String, String>,
    pub agent: AgentSettings,
    pub inputs: BTreeMap<String, Vec<toml::Table>>,
    pub outputs: BTreeMap<String, Vec<toml::Table>>,
}

impl RawConfig {
    /// Checks the handful of invariants that must hold before the config is
    /// usable: intervals must be positive, and there must be at least one
    /// output (a pipeline with nowhere to send metrics is a configuration
    /// mistake, not a valid degenerate case).
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.agent.interval.is_zero() {
            return Err(LoadError::NonPositive { field: "agent.interval" });
        }
        if self.agent.flush_interval.is_zero() {
            return Err(LoadError::NonPositive { field: "agent.flush_interval" });
        }
        if self.agent.metric_batch_size == 0 {
            return Err(LoadError::NonPositive {
                field: "agent.metric_batch_size",
            });
        }
        if self.agent.metric_buffer_limit == 0 {
            return Err(LoadError::NonPositive {
                field: "agent.metric_buffer_limit",
            });
        }
        if self.outputs.values().all(|v| v.is_empty()) {
            return Err(LoadError::NoOutputs);
        }
        Ok(())
    }
}

/// Resolves the default tags every metric gets merged with: the `tags`
/// table from the config, plus a `host` tag unless `omit_hostname` is set,
/// in which case an explicit `hostname` is used if given, falling back to
/// the OS hostname.
pub fn resolve_default_tags(raw: &RawConfig) -> std::io::Result<BTreeMap<String, String>> {
    let mut tags = raw.tags.clone();
    if !raw.agent.omit_hostname {
        let host = match &raw.agent.hostname {
            Some(h) if !h.is_empty() => h.clone(),
            _ => hostname::get()?.to_string_lossy().into_owned(),
        };
        tags.insert("host".to_string(), host);
    }
    Ok(tags)
}

/// Loads the agent configuration from a TOML file.
pub struct Loader {
    file: PathBuf,
    overrides: Option<toml::Table>,
}

impl Loader {
    /// Creates a new `Loader` that will read `file_path` on [`load`](Self::load).
    pub fn parse_file<P: Into<PathBuf>>(config_file: P) -> Self {
        Loader {
            file: config_file.into(),
            overrides: None,
        }
    }

    /// Overrides the content of the configuration by [merging](merge_override) it
    /// with another config, typically built from CLI flags. Multiple overrides can
    /// be set; they are applied in order.
    pub fn with_override(mut self, config_override: toml::Table) -> Self {
        match &mut self.overrides {
            Some(existing) => merge_override(existing, config_override),
            None => self.overrides = Some(config_override),
        }
        self
    }

    /// Reads the file, substitutes environment variables, merges in any
    /// overrides, parses the TOML, and validates the result.
    pub fn load(mut self) -> Result<RawConfig, LoadError> {
        self.load_impl().map_err(|e| LoadError::Load {
            config_file: self.file.clone(),
            source: Box::new(e),
        })
    }

    fn load_impl(&mut self) -> Result<RawConfig, LoadErrorCause> {
        let content = std::fs::read_to_string(&self.file).map_err(LoadErrorCause::Read)?;
        let content = substitute_env(&content)?;
        let mut parsed = toml::Table::from_str(&content)?;
        if let Some(overrides) = self.overrides.take() {
            merge_override(&mut parsed, overrides);
        }
        let raw: RawConfig = table_into(&parsed)?;
        raw.validate().map_err(|e| LoadErrorCause::Invalid(Box::new(e)))?;
        Ok(raw)
    }
}

/// Deserializes a [`toml::Table`] into `T` by round-tripping it through
/// TOML text. `toml::Table` only implements `Serialize`, not `Deserialize`
/// into an arbitrary type directly, so this is the supported path from a
/// dynamically-assembled table (e.g. after merging overrides) to a typed
/// config struct.
fn table_into<T: serde::de::DeserializeOwned>(table: &toml::Table) -> Result<T, toml::de::Error> {
    let text = toml::to_string(table).expect("re-serializing a parsed toml::Table cannot fail");
    toml::from_str(&text)
}

/// Replaces the pattern `${VAR_NAME}` with the value of the `VAR_NAME`
/// environment variable. The pattern can be escaped to prevent
/// replacement: `\${NOT_A_VAR}`. An undefined or non-UTF8 variable is an
/// error.
pub fn substitute_env(mut input: &str) -> Result<Cow<'_, str>, InvalidSubstitutionError> {
    let first = input.find("${");
    if first.is_none() {
        return Ok(Cow::Borrowed(input));
    }

    let mut res = String::with_capacity(input.len());
    let mut next = first;

    while let Some(begin) = next {
        let next_start;
        if begin == 0 || input.as_bytes().get(begin - 1) != Some(&b'\\') {
            res.push_str(&input[..begin]);
            input = &input[begin..];

            match input.find('}') {
                None => return Err(InvalidSubstitutionError::WrongSyntax),
                Some(end) => {
                    let env_var_name = &input[2..end];
                    match std::env::var(env_var_name) {
                        Ok(value) => res.push_str(&value),
                        Err(VarError::NotPresent) => {
                            return Err(InvalidSubstitutionError::Missing(env_var_name.to_owned()))
                        }
                        Err(VarError::NotUnicode(_)) => {
                            return Err(InvalidSubstitutionError::InvalidValue(env_var_name.to_owned()))
                        }
                    }
                    next_start = end + 1;
                }
            }
        } else {
            next_start = begin + 1;
            res.push_str(&input[..(begin - 1)]);
            res.push('$');
        }

        if let Some(more) = input.get(next_start..) {
            input = more;
            next = input.find("${");
        } else {
            next = None;
        }
    }
    res.push_str(input);
    Ok(Cow::Owned(res))
}

/// Deep-merges `overrider` into `original`, recursing into nested tables
/// and otherwise letting the override win.
pub fn merge_override(original: &mut toml::Table, overrider: toml::Table) {
    for (key, value) in overrider {
        match original.entry(key) {
            toml::map::Entry::Vacant(e) => {
                e.insert(value);
            }
            toml::map::Entry::Occupied(mut e) => match (e.get_mut(), value) {
                (toml::Value::Table(existing), toml::Value::Table(incoming)) => {
                    merge_override(existing, incoming);
                }
                (existing, incoming) => *existing = incoming,
            },
        }
    }
}

pub mod error {
    use std::path::PathBuf;
    use thiserror::Error;

    /// Everything that can go wrong while loading the agent configuration.
    #[derive(Error, Debug)]
    pub enum LoadError {
        #[error("could not load config from '{config_file}'")]
        Load {
            config_file: PathBuf,
            #[source]
            source: Box<LoadErrorCause>,
        },
        #[error("agent.{field} must be a positive duration or count")]
        NonPositive { field: &'static str },
        #[error("config must enable at least one output")]
        NoOutputs,
    }

    #[derive(Error, Debug)]
    pub enum LoadErrorCause {
        #[error("read failed")]
        Read(#[source] std::io::Error),
        #[error("env var substitution failed")]
        Substitution(#[from] InvalidSubstitutionError),
        #[error("invalid TOML config")]
        InvalidToml(#[from] toml::de::Error),
        #[error("config is invalid: {0}")]
        Invalid(#[source] Box<LoadError>),
    }

    /// Environment variable substitution failed.
    #[derive(Error, Debug, PartialEq, Eq)]
    pub enum InvalidSubstitutionError {
        #[error("the environment variable {0} does not exist")]
        Missing(String),
        #[error("value of env var {0} is not valid UTF-8")]
        InvalidValue(String),
        #[error("wrong use of the substitution syntax, it should be ${{ENV_VAR}}")]
        WrongSyntax,
    }
}

/// Maps a plugin name (as it appears under `[[inputs.<name>]]`) to a
/// constructor that builds the boxed probe from its raw config table.
pub type InputFactory = Box<dyn Fn(&toml::Table) -> anyhow::Result<Box<dyn crate::input::Input>> + Send + Sync>;

/// Maps a plugin name (as it appears under `[[outputs.<name>]]`) to a
/// constructor that builds the boxed sink from its raw config table.
pub type OutputFactory = Box<dyn Fn(&toml::Table) -> anyhow::Result<Box<dyn crate::output::Output>> + Send + Sync>;

/// The set of input/output plugins compiled into this binary. There is no
/// dynamic loading: every entry is registered by the embedding application
/// before [`build`] is called.
#[derive(Default)]
pub struct Registry {
    inputs: BTreeMap<String, InputFactory>,
    outputs: BTreeMap<String, OutputFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register_input(&mut self, name: impl Into<String>, factory: InputFactory) {
        self.inputs.insert(name.into(), factory);
    }

    pub fn register_output(&mut self, name: impl Into<String>, factory: OutputFactory) {
        self.outputs.insert(name.into(), factory);
    }
}

/// Builds a runnable [`crate::agent::Agent`] from a parsed [`RawConfig`],
/// instantiating every configured input/output through the [`Registry`].
/// Fails if a config references a plugin name the registry does not know,
/// or if a plugin's own config table fails to parse.
pub fn build(raw: RawConfig, registry: &Registry) -> anyhow::Result<crate::agent::Agent> {
    use anyhow::Context;

    let default_tags = resolve_default_tags(&raw).context("could not resolve default tags")?;
    let mut agent = crate::agent::Agent::new(raw.agent, default_tags);

    for (plugin_name, instances) in raw.inputs {
        let factory = registry
            .inputs
            .get(&plugin_name)
            .ok_or_else(|| anyhow::anyhow!("unknown input plugin: {plugin_name}"))?;
        for table in instances {
            let mut config: InputConfig =
                table_into(&table).with_context(|| format!("invalid config for inputs.{plugin_name}"))?;
            if config.name.is_empty() {
                config.name = plugin_name.clone();
            }
            let input = factory(&table).with_context(|| format!("could not build input {plugin_name}"))?;
            agent.add_input(input, config);
        }
    }

    for (plugin_name, instances) in raw.outputs {
        let factory = registry
            .outputs
            .get(&plugin_name)
            .ok_or_else(|| anyhow::anyhow!("unknown output plugin: {plugin_name}"))?;
        for table in instances {
            let mut config: OutputConfig =
                table_into(&table).with_context(|| format!("invalid config for outputs.{plugin_name}"))?;
            if config.name.is_empty() {
                config.name = plugin_name.clone();
            }
            let output = factory(&table).with_context(|| format!("could not build output {plugin_name}"))?;
            agent.add_output(output, config);
        }
    }

    Ok(agent)
}

#[cfg(test)]
mod tests_substitute_env {
    use super::*;

    const ENV_VAR_NAME: &str = "CARGO_PKG_NAME";
    const ENV_VAR_VALUE: &str = env!("CARGO_PKG_NAME");

    #[test]
    fn no_substitution() {
        let input = "agent.interval = \"10s\"";
        assert_eq!(Cow::Borrowed(input), substitute_env(input).unwrap());
    }

    #[test]
    fn basic_substitution() {
        let input = "name = \"${CARGO_PKG_NAME}\"";
        let expected = format!("name = \"{ENV_VAR_VALUE}\"");
        assert_eq!(expected, substitute_env(input).unwrap());
    }

    #[test]
    fn escaped_substitution_is_left_as_a_literal_dollar_brace() {
        let input = "pattern = \"\\${NOT_A_VAR}\"";
        let expected = "pattern = \"${NOT_A_VAR}\"";
        assert_eq!(expected, substitute_env(input).unwrap());
    }

    #[test]
    fn missing_variable_is_an_error() {
        let input = "${DEFINITELY_NOT_SET_ABCDEF}";
        assert_eq!(
            substitute_env(input),
            Err(InvalidSubstitutionError::Missing("DEFINITELY_NOT_SET_ABCDEF".to_string()))
        );
    }

    #[test]
    fn unclosed_substitution_is_an_error() {
        assert_eq!(substitute_env("${UNCLOSED"), Err(InvalidSubstitutionError::WrongSyntax));
    }

    #[test]
    fn var_name_exists_at_compile_time_and_runtime() {
        assert_eq!(std::env::var(ENV_VAR_NAME).as_deref(), Ok(ENV_VAR_VALUE));
    }
}

#[cfg(test)]
mod tests_merge {
    use super::*;

    #[test]
    fn merge_override_recurses_into_nested_tables() {
        let mut original = toml::Table::from_str(
            r#"
            [agent]
            interval = "10s"
            flush_interval = "5s"
            "#,
        )
        .unwrap();
        let overrides = toml::Table::from_str(
            r#"[agent]
            interval = "1s""#,
        )
        .unwrap();
        merge_override(&mut original, overrides);
        let agent = original["agent"].as_table().unwrap();
        assert_eq!(agent["interval"].as_str(), Some("1s"));
        assert_eq!(agent["flush_interval"].as_str(), Some("5s"));
    }
}

#[cfg(test)]
mod tests_raw_config {
    use super::*;

    fn minimal_valid_toml() -> &'static str {
        r#"
        [agent]
        interval = "10s"
        flush_interval = "10s"

        [[outputs.file]]
        "#
    }

    #[test]
    fn parses_agent_inputs_outputs_and_tags() {
        let text = r#"
        [tags]
        region = "eu"

        [agent]
        interval = "1s"
        flush_interval = "2s"
        round_interval = false

        [[inputs.mem]]
        name_prefix = "sys_"

        [[outputs.file]]
        metric_batch_size = 5
        "#;
        let parsed = toml::Table::from_str(text).unwrap();
        let raw: RawConfig = table_into(&parsed).unwrap();
        assert_eq!(raw.tags.get("region"), Some(&"eu".to_string()));
        assert_eq!(raw.agent.interval, Duration::from_secs(1));
        assert!(!raw.agent.round_interval);
        assert_eq!(raw.inputs["mem"].len(), 1);
        assert_eq!(raw.outputs["file"].len(), 1);
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let parsed = toml::Table::from_str(minimal_valid_toml()).unwrap();
        let mut raw: RawConfig = table_into(&parsed).unwrap();
        raw.agent.interval = Duration::ZERO;
        assert!(matches!(raw.validate(), Err(LoadError::NonPositive { field: "agent.interval" })));
    }

    #[test]
    fn validate_rejects_no_outputs() {
        let parsed = toml::Table::from_str("[agent]\ninterval = \"1s\"\nflush_interval = \"1s\"").unwrap();
        let raw: RawConfig = table_into(&parsed).unwrap();
        assert!(matches!(raw.validate(), Err(LoadError::NoOutputs)));
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let parsed = toml::Table::from_str(minimal_valid_toml()).unwrap();
        let raw: RawConfig = table_into(&parsed).unwrap();
        assert!(raw.validate().is_ok());
    }
}
