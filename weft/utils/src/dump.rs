use std::fs;
use std::path::PathBuf;

/// Destination and verbosity for best-effort debug artifacts (dot graphs,
/// hMetis hypergraph descriptions). Dump failures are logged, never fatal:
/// artifacts are for humans and the pipeline must not depend on them.
#[derive(Clone, Debug, Default)]
pub struct DumpCtx {
    dir: Option<PathBuf>,
    level: u32,
}

impl DumpCtx {
    pub fn new(dir: PathBuf, level: u32) -> Self {
        DumpCtx {
            dir: Some(dir),
            level,
        }
    }

    /// A context that never writes anything.
    pub fn disabled() -> Self {
        DumpCtx::default()
    }

    pub fn enabled(&self, level: u32) -> bool {
        self.dir.is_some() && self.level >= level
    }

    /// Write `contents` to `<dir>/<name>` if dumping is enabled at `level`.
    pub fn write(&self, level: u32, name: &str, contents: &str) {
        let dir = match &self.dir {
            Some(dir) if self.level >= level => dir,
            _ => return,
        };
        let path = dir.join(name);
        let res = fs::create_dir_all(dir).and_then(|_| fs::write(&path, contents));
        match res {
            Ok(()) => log::info!("dumped {}", path.display()),
            Err(err) => log::warn!("could not dump {}: {}", path.display(), err),
        }
    }
}
