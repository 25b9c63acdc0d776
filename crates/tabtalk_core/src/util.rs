use anyhow::Result;
use directories::ProjectDirs;
use std::{env, fs, path::{Path, PathBuf}};

pub fn app_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "tabtalk", "tabtalk")
        .ok_or_else(|| anyhow::anyhow!("ProjectDirs unavailable"))
}

/// Root for everything the service persists (runs, uploads, the workflow
/// store). `TABTALK_DATA_DIR` overrides the platform default.
pub fn default_data_root() -> Result<PathBuf> {
    if let Ok(custom) = env::var("TABTALK_DATA_DIR") {
        let root = PathBuf::from(custom);
        fs::create_dir_all(&root)?;
        return Ok(root);
    }
    let pd = app_dirs()?;
    let root = pd.data_dir().to_path_buf();
    fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn default_runs_root() -> Result<PathBuf> {
    let root = default_data_root()?.join("runs");
    fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn default_uploads_root() -> Result<PathBuf> {
    let root = default_data_root()?.join("uploads");
    fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn default_workflow_db_path() -> Result<PathBuf> {
    Ok(default_data_root()?.join("workflows.sqlite3"))
}

pub fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn is_path_within(base: &Path, candidate: &Path) -> bool {
    match candidate
        .canonicalize()
        .and_then(|p| base.canonicalize().map(|b| (b, p)))
    {
        Ok((b, p)) => p.starts_with(b),
        Err(_) => false,
    }
}
