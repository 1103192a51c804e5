/// Configuration command handlers
use anyhow::Result;
use rhythm_core::{config::default_config_path, Settings};
use std::path::{Path, PathBuf};

pub fn show(settings: &Settings) -> Result<()> {
    print!("{}", settings.to_toml()?);
    Ok(())
}

pub fn path(explicit: Option<&Path>) -> Result<()> {
    println!("{}", resolve(explicit)?.display());
    Ok(())
}

pub fn init(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = write_defaults(explicit, force)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn resolve(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => default_config_path(),
    }
}

fn write_defaults(explicit: Option<&Path>, force: bool) -> Result<PathBuf> {
    let path = resolve(explicit)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }
    Settings::default().save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let written = write_defaults(Some(&path), false).unwrap();
        assert_eq!(written, path);
        assert_eq!(Settings::load(Some(&path)).unwrap(), Settings::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\ntotal_reps = 8\n").unwrap();

        assert!(write_defaults(Some(&path), false).is_err());
        assert_eq!(Settings::load(Some(&path)).unwrap().session.total_reps, 8);

        write_defaults(Some(&path), true).unwrap();
        assert_eq!(Settings::load(Some(&path)).unwrap().session.total_reps, 20);
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/tmp/rhythm-test.toml");
        assert_eq!(resolve(Some(path)).unwrap(), path);
    }
}
