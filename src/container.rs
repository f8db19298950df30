//! On-disk container identity: each container is a short name keyed to a
//! directory under `$LXCPATH` holding its `config` file, an optional
//! `mount` table file, and a `run/` directory used only while the
//! container is alive.

use std::fs::create_dir_all;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::Conf;
use crate::error::{Error, Result};

/// Deliberately distinct from the original LXC's own `/var/lib/lxc`, so a
/// `lxcore`-managed tree never collides with a real LXC install on the same
/// host.
pub const DEFAULT_LXCPATH: &str = "/var/lib/lxcore";
const CONFIG_FILE: &str = "config";
const RUN_DIR: &str = "run";

/// Resolves the container base path: `$LXCPATH` if set, else the
/// compile-time default.
pub fn base_path() -> PathBuf {
    std::env::var("LXCPATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LXCPATH))
}

/// A named container's identity directory.
#[derive(Debug, Clone)]
pub struct Container {
    name: String,
    path: PathBuf,
}

impl Container {
    pub fn path_for(base: &Path, name: &str) -> PathBuf {
        base.join(name)
    }

    /// Creates a container's on-disk directory and writes its config file,
    /// copied verbatim from the source path given on the command line.
    pub fn create(base: &Path, name: &str, config_src: &Path) -> Result<Self> {
        let path = Self::path_for(base, name);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Config(format!("container '{name}' already exists")));
            }
            Err(e) => return Err(Error::Io(e)),
        }
        if let Err(e) = std::fs::copy(config_src, path.join(CONFIG_FILE)) {
            let _ = std::fs::remove_dir_all(&path);
            return Err(Error::Io(e));
        }
        Ok(Self {
            name: name.to_owned(),
            path,
        })
    }

    /// Creates a container's on-disk directory and writes `text` as its
    /// config file verbatim. Used by `lxc-create` when invoked with no
    /// source config file (`-f`), which gets an empty default config.
    pub fn create_with_text(base: &Path, name: &str, text: &str) -> Result<Self> {
        let path = Self::path_for(base, name);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Config(format!("container '{name}' already exists")));
            }
            Err(e) => return Err(Error::Io(e)),
        }
        if let Err(e) = std::fs::write(path.join(CONFIG_FILE), text) {
            let _ = std::fs::remove_dir_all(&path);
            return Err(Error::Io(e));
        }
        Ok(Self {
            name: name.to_owned(),
            path,
        })
    }

    /// Opens an existing container by name, failing if its directory or
    /// config file is missing.
    pub fn open(base: &Path, name: &str) -> Result<Self> {
        let path = Self::path_for(base, name);
        if !path.join(CONFIG_FILE).is_file() {
            return Err(Error::Config(format!("container '{name}' not found")));
        }
        Ok(Self {
            name: name.to_owned(),
            path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.path.join(RUN_DIR)
    }

    pub fn load_conf(&self) -> Result<Conf> {
        Conf::from_file(self.config_path())
    }

    /// Creates the per-run nonce directory used while the container is
    /// alive (e.g. to hold the pty symlinks `console.attach` resolves).
    pub fn prepare_run_dir(&self) -> Result<PathBuf> {
        let dir = self.run_dir();
        create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn teardown_run_dir(&self) -> Result<()> {
        match std::fs::remove_dir_all(self.run_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn create_then_open_round_trips() {
        let base = std::env::temp_dir().join(format!("lxcore-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(&base).unwrap();

        let config_src = base.join("source-config");
        let mut f = std::fs::File::create(&config_src).unwrap();
        writeln!(f, "lxc.utsname = box").unwrap();

        let created = Container::create(&base, "box", &config_src).unwrap();
        let opened = Container::open(&base, "box").unwrap();
        assert_eq!(created.path(), opened.path());

        let conf = opened.load_conf().unwrap();
        assert_eq!(conf.utsname.as_deref(), Some("box"));

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn create_twice_fails() {
        let base = std::env::temp_dir().join(format!("lxcore-test2-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(&base).unwrap();
        let config_src = base.join("source-config");
        std::fs::write(&config_src, "lxc.utsname = box\n").unwrap();

        Container::create(&base, "box", &config_src).unwrap();
        assert!(Container::create(&base, "box", &config_src).is_err());

        std::fs::remove_dir_all(&base).unwrap();
    }
}
