//! Immutable service configuration, resolved once at startup.
//!
//! Every directory can be overridden independently through the environment;
//! unset variables fall back to a layout rooted at `WORKDIR`.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::weights::WeightBundle;

pub const DEFAULT_WORKDIR: &str = "/workspace";
pub const DEFAULT_PYTHON: &str = "python";
pub const GENERATE_SCRIPT: &str = "generate_infinitetalk.py";

const HF_CACHE_VARS: [&str; 3] = ["HF_HOME", "HUGGINGFACE_HUB_CACHE", "TRANSFORMERS_CACHE"];
const THREAD_VARS: [&str; 2] = ["OMP_NUM_THREADS", "MKL_NUM_THREADS"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub workdir: PathBuf,
    pub weights_dir: PathBuf,
    pub out_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Hub download cache (`HUGGINGFACE_HUB_CACHE`).
    pub hub_cache: PathBuf,
    /// Checkout of the InfiniteTalk sources; the child runs from here.
    pub code_dir: PathBuf,
    pub python: String,
    /// Pass `--num_persistent_param_in_dit 0` to the generation script.
    pub low_vram: bool,
    /// Environment overrides applied to every child process.
    pub child_env: Vec<(String, String)>,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration through `lookup` instead of the process
    /// environment. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let path_or = |key: &str, default: PathBuf| get(key).map(PathBuf::from).unwrap_or(default);

        let workdir = absolute(path_or("WORKDIR", PathBuf::from(DEFAULT_WORKDIR)));
        let weights_dir = absolute(path_or("WEIGHTS_DIR", workdir.join("weights")));
        let out_dir = absolute(path_or("OUT_DIR", workdir.join("outputs")));
        let cache_dir = absolute(path_or("CACHE_DIR", workdir.join("cache")));
        let code_dir = absolute(path_or("CODE_DIR", workdir.join("InfiniteTalk")));

        let hf_default = cache_dir.join("hf");
        let mut child_env = Vec::new();
        for var in HF_CACHE_VARS {
            let value = path_or(var, hf_default.clone());
            child_env.push((var.to_string(), value.display().to_string()));
        }
        // Keep the host's thread settings if it has any.
        for var in THREAD_VARS {
            if get(var).is_none() {
                child_env.push((var.to_string(), "1".to_string()));
            }
        }
        let hub_cache = path_or("HUGGINGFACE_HUB_CACHE", hf_default);

        let python = get("TALKHEAD_PYTHON").unwrap_or_else(|| DEFAULT_PYTHON.to_string());
        let low_vram = match get("TALKHEAD_LOW_VRAM") {
            Some(raw) => match parse_flag(&raw) {
                Some(flag) => flag,
                None => {
                    warn!("Invalid TALKHEAD_LOW_VRAM='{}', falling back to true", raw);
                    true
                }
            },
            None => true,
        };

        Self {
            workdir,
            weights_dir,
            out_dir,
            cache_dir,
            hub_cache,
            code_dir,
            python,
            low_vram,
            child_env,
        }
    }

    pub fn bundle_dir(&self, bundle: WeightBundle) -> PathBuf {
        self.weights_dir.join(bundle.dir_name())
    }

    pub fn script_path(&self) -> PathBuf {
        self.code_dir.join(GENERATE_SCRIPT)
    }

    /// Parent of the per-request staging directories, on the same volume as
    /// the outputs.
    pub fn staging_root(&self) -> PathBuf {
        self.workdir.join("tmp")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.workdir,
            &self.weights_dir,
            &self.out_dir,
            &self.cache_dir,
            &self.code_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::path::absolute(&path).unwrap_or_else(|_| Path::new("/").join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServiceConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    fn env_value<'a>(config: &'a ServiceConfig, key: &str) -> Option<&'a str> {
        config
            .child_env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn defaults_are_rooted_at_workspace() {
        let config = config(&[]);
        assert_eq!(config.workdir, PathBuf::from("/workspace"));
        assert_eq!(config.weights_dir, PathBuf::from("/workspace/weights"));
        assert_eq!(config.out_dir, PathBuf::from("/workspace/outputs"));
        assert_eq!(config.cache_dir, PathBuf::from("/workspace/cache"));
        assert_eq!(config.code_dir, PathBuf::from("/workspace/InfiniteTalk"));
        assert_eq!(config.hub_cache, PathBuf::from("/workspace/cache/hf"));
        assert_eq!(
            config.script_path(),
            PathBuf::from("/workspace/InfiniteTalk/generate_infinitetalk.py")
        );
        assert_eq!(config.staging_root(), PathBuf::from("/workspace/tmp"));
        assert_eq!(config.python, "python");
        assert!(config.low_vram);
    }

    #[test]
    fn directories_follow_workdir_unless_overridden() {
        let config = config(&[("WORKDIR", "/data"), ("OUT_DIR", "/mnt/videos")]);
        assert_eq!(config.weights_dir, PathBuf::from("/data/weights"));
        assert_eq!(config.out_dir, PathBuf::from("/mnt/videos"));
        assert_eq!(
            config.bundle_dir(WeightBundle::Wav2Vec),
            PathBuf::from("/data/weights/chinese-wav2vec2-base")
        );
    }

    #[test]
    fn hub_cache_vars_default_under_cache_dir() {
        let config = config(&[("CACHE_DIR", "/cache"), ("HF_HOME", "/hf-home")]);
        assert_eq!(env_value(&config, "HF_HOME"), Some("/hf-home"));
        assert_eq!(env_value(&config, "HUGGINGFACE_HUB_CACHE"), Some("/cache/hf"));
        assert_eq!(env_value(&config, "TRANSFORMERS_CACHE"), Some("/cache/hf"));
        assert_eq!(config.hub_cache, PathBuf::from("/cache/hf"));
    }

    #[test]
    fn thread_limits_only_set_when_host_has_none() {
        let config = config(&[("OMP_NUM_THREADS", "8")]);
        assert_eq!(env_value(&config, "OMP_NUM_THREADS"), None);
        assert_eq!(env_value(&config, "MKL_NUM_THREADS"), Some("1"));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = config(&[("WORKDIR", "  "), ("TALKHEAD_PYTHON", "")]);
        assert_eq!(config.workdir, PathBuf::from("/workspace"));
        assert_eq!(config.python, "python");
    }

    #[test]
    fn low_vram_flag_parsing() {
        assert!(!config(&[("TALKHEAD_LOW_VRAM", "off")]).low_vram);
        assert!(config(&[("TALKHEAD_LOW_VRAM", "YES")]).low_vram);
        assert!(config(&[("TALKHEAD_LOW_VRAM", "maybe")]).low_vram);
    }

    #[test]
    fn relative_paths_become_absolute() {
        let config = config(&[("WORKDIR", "relative/work")]);
        assert!(config.workdir.is_absolute());
        assert!(config.workdir.ends_with("relative/work"));
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let root = tempfile::tempdir().unwrap();
        let config = config(&[("WORKDIR", root.path().to_str().unwrap())]);
        config.ensure_dirs().unwrap();
        assert!(config.weights_dir.is_dir());
        assert!(config.out_dir.is_dir());
        assert!(config.cache_dir.is_dir());
        assert!(config.code_dir.is_dir());
    }
}
