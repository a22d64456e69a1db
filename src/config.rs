//! Runtime options.
//!
//! Resolution order: built-in defaults, then an optional options file, then
//! `HETARRAY_*` environment variables. The file is JSON when its extension
//! is `.json`, otherwise one `key = value` pair per line with `#` comments.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Spread maps over every device instead of the first one.
    pub multi_device: bool,
    /// Append the deoptimization guard buffer to every launch.
    pub deopt_guards: bool,
    /// Fall back to host threads when the device path fails.
    pub deoptimize: bool,
    pub profile: bool,
    /// Worker threads for host execution. 0 means available parallelism.
    pub host_threads: usize,
    /// Elements per chunk in pipelines.
    pub pipeline_chunk: usize,
    /// Log generated kernel source and binary sizes at info level.
    pub print_kernel_info: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            multi_device: true,
            deopt_guards: true,
            deoptimize: true,
            profile: false,
            host_threads: 0,
            pipeline_chunk: 1024,
            print_kernel_info: false,
        }
    }
}

const ENV_PREFIX: &str = "HETARRAY_";

impl RuntimeOptions {
    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        options.apply_env()?;
        Ok(options)
    }

    /// Options file overlaid with the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut options: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            Self::parse(&content)?
        };
        if options.pipeline_chunk == 0 {
            return Err(Error::Config {
                key: "pipeline_chunk".into(),
                reason: "must be positive".into(),
            });
        }
        options.apply_env()?;
        Ok(options)
    }

    /// Parse `key = value` lines.
    pub fn parse(content: &str) -> Result<Self> {
        let mut options = Self::default();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| Error::Config {
                key: line.to_string(),
                reason: "expected `key = value`".into(),
            })?;
            options.set(key.trim(), value.trim().trim_matches('"'))?;
        }
        Ok(options)
    }

    /// Set one option by name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "multi_device" => self.multi_device = parse_flag(key, value)?,
            "deopt_guards" => self.deopt_guards = parse_flag(key, value)?,
            "deoptimize" => self.deoptimize = parse_flag(key, value)?,
            "profile" => self.profile = parse_flag(key, value)?,
            "host_threads" => self.host_threads = parse_count(key, value)?,
            "pipeline_chunk" => {
                self.pipeline_chunk = parse_count(key, value)?;
                if self.pipeline_chunk == 0 {
                    return Err(Error::Config {
                        key: key.into(),
                        reason: "must be positive".into(),
                    });
                }
            }
            "print_kernel_info" => self.print_kernel_info = parse_flag(key, value)?,
            _ => {
                return Err(Error::Config {
                    key: key.into(),
                    reason: "unknown option".into(),
                })
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(std::env::vars())
    }

    fn apply_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                self.set(&key.to_ascii_lowercase(), value.trim())?;
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config {
            key: key.into(),
            reason: format!("expected a boolean, got `{value}`"),
        }),
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| Error::Config {
        key: key.into(),
        reason: format!("expected a non-negative integer, got `{value}`"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn key_value_file() {
        let options = RuntimeOptions::parse(
            "# tuning\nmulti_device = false\nhost_threads = 6  # pinned\npipeline_chunk=\"256\"\n",
        )
        .unwrap();
        assert!(!options.multi_device);
        assert_eq!(options.host_threads, 6);
        assert_eq!(options.pipeline_chunk, 256);
        assert!(options.deopt_guards);
    }

    #[test]
    fn bad_values_rejected() {
        assert!(matches!(
            RuntimeOptions::parse("profile = maybe"),
            Err(Error::Config { .. })
        ));
        assert!(RuntimeOptions::parse("pipeline_chunk = 0").is_err());
        assert!(RuntimeOptions::parse("colour = blue").is_err());
        assert!(RuntimeOptions::parse("just a line").is_err());
    }

    #[test]
    fn json_file_fills_missing_fields() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"profile": true, "host_threads": 2}}"#).unwrap();
        let options = RuntimeOptions::load(file.path()).unwrap();
        assert!(options.profile);
        assert_eq!(options.host_threads, 2);
        assert_eq!(options.pipeline_chunk, 1024);
    }

    #[test]
    fn plain_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hetarray.conf");
        std::fs::write(&path, "deoptimize = off\n").unwrap();
        let options = RuntimeOptions::load(&path).unwrap();
        assert!(!options.deoptimize);
    }

    #[test]
    fn environment_overrides() {
        let mut options = RuntimeOptions::default();
        options
            .apply_vars([
                ("HETARRAY_PROFILE".to_string(), "1".to_string()),
                ("HETARRAY_HOST_THREADS".to_string(), " 12 ".to_string()),
                ("PATH".to_string(), "/bin".to_string()),
            ])
            .unwrap();
        assert!(options.profile);
        assert_eq!(options.host_threads, 12);
    }
}
