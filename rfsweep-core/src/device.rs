//! Device selection for launched stages.
//!
//! The GPU index is carried as environment for each child process instead of
//! being written to the orchestrator's own environment.

use std::collections::BTreeMap;

/// Environment variable the external programs read to pick a device.
pub const DEVICE_ENV_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Environment applied to a single launched stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageEnv {
    vars: BTreeMap<String, String>,
}

impl StageEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment scoped to one GPU.
    pub fn for_gpu(gpu_id: u32) -> Self {
        let mut env = Self::new();
        env.set_gpu(gpu_id);
        env
    }

    /// Select the device every process launched with this environment sees.
    pub fn set_gpu(&mut self, gpu_id: u32) {
        self.set(DEVICE_ENV_VAR, gpu_id.to_string());
    }

    /// Current device selection, if any.
    pub fn gpu(&self) -> Option<&str> {
        self.get(DEVICE_ENV_VAR)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_gpu() {
        let mut env = StageEnv::new();
        assert_eq!(env.gpu(), None);
        env.set_gpu(2);
        assert_eq!(env.get(DEVICE_ENV_VAR), Some("2"));
    }

    #[test]
    fn test_set_gpu_replaces_previous() {
        let mut env = StageEnv::for_gpu(0);
        env.set_gpu(5);
        assert_eq!(env.gpu(), Some("5"));
        assert_eq!(env.iter().count(), 1);
    }

    #[test]
    fn test_does_not_touch_process_env() {
        let before = std::env::var(DEVICE_ENV_VAR).ok();
        let _env = StageEnv::for_gpu(7);
        assert_eq!(std::env::var(DEVICE_ENV_VAR).ok(), before);
    }
}
