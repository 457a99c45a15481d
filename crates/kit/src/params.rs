//! Test parameters
//!
//! Parameters arrive as a flat string map, the same shape a test harness
//! hands to a test case. They can be loaded from a JSON file and overridden
//! on the command line with `-p KEY=VALUE`.

use std::collections::BTreeMap;

use camino::Utf8Path;
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde_json::Value;

/// Flat string parameters keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    /// Value for `key`, or `default` when unset.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Value for `key` if set to a non-empty string.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Boolean flags are only enabled by the literal `yes`.
    pub fn is_yes(&self, key: &str) -> bool {
        self.get(key) == Some("yes")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Parse a single `KEY=VALUE` assignment.
    pub fn parse_assignment(s: &str) -> Result<(String, String), String> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| format!("Expected KEY=VALUE, got: {s}"))?;
        let k = k.trim();
        if k.is_empty() {
            return Err(format!("Empty parameter name in: {s}"));
        }
        Ok((k.to_string(), v.to_string()))
    }

    /// Load parameters from a JSON object.
    ///
    /// Strings are taken verbatim, numbers and booleans are stringified,
    /// `null` entries are skipped.
    pub fn from_json_file(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)
            .with_context(|| format!("Reading parameters from {path}"))?;
        Self::from_json_str(&buf).with_context(|| format!("Loading parameters from {path}"))
    }

    pub fn from_json_str(buf: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(buf).context("Parsing JSON")?;
        let obj = value
            .as_object()
            .ok_or_else(|| eyre!("Expected a JSON object of parameters"))?;
        let mut params = Self::new();
        for (k, v) in obj {
            let v = match v {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                other => return Err(eyre!("Unsupported value for parameter {k}: {other}")),
            };
            params.set(k.clone(), v);
        }
        Ok(params)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Command line options shared by every subcommand that takes parameters.
#[derive(Debug, Parser, Clone, Default)]
pub struct ParamOpts {
    /// JSON file holding an object of test parameters
    #[clap(long)]
    pub params_file: Option<camino::Utf8PathBuf>,

    /// Set a parameter (e.g. -p ceph_disk_name=rbd/test.img); overrides the params file
    #[clap(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = Params::parse_assignment)]
    pub params: Vec<(String, String)>,
}

impl ParamOpts {
    pub fn load(&self) -> Result<Params> {
        let mut params = match self.params_file.as_deref() {
            Some(path) => Params::from_json_file(path)?,
            None => Params::new(),
        };
        for (k, v) in &self.params {
            params.set(k.clone(), v.clone());
        }
        Ok(params)
    }
}
