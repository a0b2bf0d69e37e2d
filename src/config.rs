//! `GSW_HOME`-relative path resolution (§6 EXTERNAL INTERFACES).

use std::path::PathBuf;

use crate::error::GswError;

/// Reads `GSW_HOME` from the environment. The fabric refuses to run without
/// it: config lookups and shared-memory anchor paths are rooted here so
/// unrelated programs can attach to the same segments by convention.
pub fn gsw_home() -> Result<PathBuf, GswError> {
    std::env::var_os("GSW_HOME")
        .map(PathBuf::from)
        .ok_or_else(|| GswError::failure("config", "gsw_home", "GSW_HOME is not set"))
}

/// Default config file path for a named vehicle: `$GSW_HOME/config/<name>.cfg`.
pub fn default_config_path(vehicle_name: &str) -> Result<PathBuf, GswError> {
    Ok(gsw_home()?.join("config").join(format!("{vehicle_name}.cfg")))
}

/// Stable shared-memory anchor file for a named vehicle: `$GSW_HOME/shm/<name>`.
///
/// This file need not contain anything; its path (combined with a small
/// integer tag) is the identity a [`crate::shm::SharedSegment`] attaches by.
pub fn shm_anchor_path(vehicle_name: &str) -> Result<PathBuf, GswError> {
    Ok(gsw_home()?.join("shm").join(vehicle_name))
}

/// Log directory for a named vehicle: `$GSW_HOME/log`.
pub fn log_dir() -> Result<PathBuf, GswError> {
    Ok(gsw_home()?.join("log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_gsw_home_is_failure() {
        std::env::remove_var("GSW_HOME");
        assert!(gsw_home().is_err());
    }

    #[test]
    fn paths_root_under_gsw_home() {
        std::env::set_var("GSW_HOME", "/tmp/gsw-test-root");
        assert_eq!(
            default_config_path("rocket").unwrap(),
            PathBuf::from("/tmp/gsw-test-root/config/rocket.cfg")
        );
        assert_eq!(
            shm_anchor_path("rocket").unwrap(),
            PathBuf::from("/tmp/gsw-test-root/shm/rocket")
        );
        std::env::remove_var("GSW_HOME");
    }
}
