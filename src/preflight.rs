use std::{
    env,
    path::{Path, PathBuf},
};

use crate::{
    errors::{Result, UndervoltError},
    policy_config::PolicyConfig,
};

// Check the environment before touching the GPU.
// Root is not needed in dry-run mode
pub fn check(policy: &PolicyConfig, dry_run: bool) -> Result<()> {
    if !dry_run && !is_root() {
        return Err(UndervoltError::config(
            "This program must be run as root (sudo)",
        ));
    }

    require_tool("nvidia-smi")?;

    if policy.use_offsets {
        require_tool("nvidia-settings")?;
    }

    Ok(())
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and can't fail
    unsafe { libc::geteuid() == 0 }
}

fn require_tool(name: &str) -> Result<PathBuf> {
    let path = env::var_os("PATH").unwrap_or_default();

    find_in_path(name, env::split_paths(&path)).ok_or_else(|| {
        UndervoltError::config(format!("Required tool '{name}' not found in PATH"))
    })
}

// Return the first directory entry named `name` that is a file
fn find_in_path(
    name: &str,
    dirs: impl IntoIterator<Item = PathBuf>,
) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_file(candidate))
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
