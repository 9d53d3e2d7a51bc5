//! # Executable Repository
//!
//! A process-global, mutex-protected store of node executables by platform
//! tag. Sources are registered explicitly (the setup message ships embedded
//! images to freshly launched nodes) or by self-init, which recognizes when
//! the current process *is* a node executable and registers its own image
//! for its own platform.
//!
//! Byte-image sources are extracted on demand to a temporary directory as
//! `antler-node-<platform>` and reference-counted: the file is deleted when
//! the last user releases it, and the directory is deleted when no files
//! remain.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;
use uuid::Uuid;

/// Basename prefix of node executables.
pub const NODE_PREFIX: &str = "antler-node";

/// The platform tag of the current process, `<os>-<arch>`.
pub fn platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// A source capable of producing a node executable for one platform.
pub enum Source {
    /// An executable already on disk (used directly, no extraction)
    File(PathBuf),

    /// An embedded image, extracted to the temp directory on first use
    Bytes(Arc<Vec<u8>>),
}

impl Source {
    pub fn bytes(data: Vec<u8>) -> Self {
        Source::Bytes(Arc::new(data))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }
}

struct Extracted {
    path: PathBuf,
    refs: usize,
}

#[derive(Default)]
struct Repo {
    sources: HashMap<String, Source>,
    extracted: HashMap<String, Extracted>,
    dir: Option<PathBuf>,
}

fn repo() -> &'static Mutex<Repo> {
    static REPO: OnceLock<Mutex<Repo>> = OnceLock::new();
    REPO.get_or_init(|| Mutex::new(Repo::default()))
}

/// Register (or replace) the source for `platform`.
pub fn register(platform: &str, source: Source) {
    let mut repo = repo().lock().unwrap();
    repo.sources.insert(platform.to_string(), source);
}

/// Whether a source is registered for `platform`.
pub fn has(platform: &str) -> bool {
    repo().lock().unwrap().sources.contains_key(platform)
}

/// The raw executable image for `platform`, for shipping to a child node in
/// a setup message.
pub fn image(platform: &str) -> Result<Vec<u8>> {
    let repo = repo().lock().unwrap();
    match repo.sources.get(platform) {
        Some(Source::Bytes(b)) => Ok(b.as_ref().clone()),
        Some(Source::File(p)) => {
            std::fs::read(p).with_context(|| format!("reading node executable {:?}", p))
        }
        None => Err(anyhow!("no node executable for platform {}", platform)),
    }
}

/// A leased, extracted executable. Release decrements the reference count;
/// the file disappears at zero.
pub struct ExeRef {
    platform: String,
    path: PathBuf,
    counted: bool,
}

impl ExeRef {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Give the lease back. For byte-image sources this decrements the
    /// reference count, deleting the extracted file at zero and the temp
    /// directory once empty.
    pub fn release(self) -> Result<()> {
        if !self.counted {
            return Ok(());
        }
        let mut repo = repo().lock().unwrap();
        let remove = match repo.extracted.get_mut(&self.platform) {
            Some(e) => {
                e.refs -= 1;
                e.refs == 0
            }
            None => false,
        };
        if remove {
            if let Some(e) = repo.extracted.remove(&self.platform) {
                std::fs::remove_file(&e.path)
                    .with_context(|| format!("removing {:?}", e.path))?;
                debug!("removed extracted executable {:?}", e.path);
            }
            if repo.extracted.is_empty() {
                if let Some(dir) = repo.dir.take() {
                    std::fs::remove_dir(&dir).with_context(|| format!("removing {:?}", dir))?;
                    debug!("removed extraction directory {:?}", dir);
                }
            }
        }
        Ok(())
    }
}

/// Lease the executable for `platform`, extracting it first if the source is
/// a byte image.
pub fn acquire(platform: &str) -> Result<ExeRef> {
    let mut repo = repo().lock().unwrap();

    if let Some(e) = repo.extracted.get_mut(platform) {
        e.refs += 1;
        return Ok(ExeRef {
            platform: platform.to_string(),
            path: e.path.clone(),
            counted: true,
        });
    }

    let bytes = match repo.sources.get(platform) {
        Some(Source::File(path)) => {
            return Ok(ExeRef {
                platform: platform.to_string(),
                path: path.clone(),
                counted: false,
            })
        }
        Some(Source::Bytes(bytes)) => bytes.clone(),
        None => return Err(anyhow!("no node executable for platform {}", platform)),
    };

    let dir = match &repo.dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = std::env::temp_dir().join(format!("antler-{}", Uuid::new_v4()));
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
            repo.dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}-{}", NODE_PREFIX, platform));
    std::fs::write(&path, bytes.as_slice()).with_context(|| format!("writing {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {:?}", path))?;
    }
    debug!("extracted node executable {:?}", path);
    repo.extracted.insert(
        platform.to_string(),
        Extracted {
            path: path.clone(),
            refs: 1,
        },
    );
    Ok(ExeRef {
        platform: platform.to_string(),
        path,
        counted: true,
    })
}

/// Register the current process as the source for its own platform when it
/// is a standalone node executable. Returns whether it is one.
pub fn self_init() -> bool {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(_) => return false,
    };
    let is_node = exe
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(NODE_PREFIX))
        .unwrap_or(false);
    if is_node {
        register(&platform(), Source::File(exe));
    }
    is_node
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_unregistered_platform_fails() {
        assert!(acquire("test-none-mips64").is_err());
    }

    #[test]
    fn file_source_is_used_in_place() {
        register("test-file-riscv64", Source::file("/usr/bin/env"));
        let a = acquire("test-file-riscv64").unwrap();
        assert_eq!(a.path(), std::path::Path::new("/usr/bin/env"));
        a.release().unwrap();
    }

    #[test]
    fn byte_source_extracts_refcounts_and_cleans_up() {
        register("test-bytes-s390x", Source::bytes(vec![0x7f, b'E', b'L', b'F']));

        let a = acquire("test-bytes-s390x").unwrap();
        let b = acquire("test-bytes-s390x").unwrap();
        let path = a.path().to_path_buf();
        let dir = path.parent().unwrap().to_path_buf();
        assert_eq!(path, b.path());
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(NODE_PREFIX));

        a.release().unwrap();
        assert!(path.exists(), "file must survive until the last release");
        b.release().unwrap();
        assert!(!path.exists(), "file must be deleted at refcount zero");
        // The directory may host other tests' extractions; it is gone only
        // when nothing remains.
        if dir.exists() {
            assert!(std::fs::read_dir(&dir).unwrap().next().is_some());
        }
    }

    #[test]
    fn image_round_trips_byte_sources() {
        register("test-bytes-ppc64", Source::bytes(vec![1, 2, 3]));
        assert_eq!(image("test-bytes-ppc64").unwrap(), vec![1, 2, 3]);
        assert!(image("test-none-arm7").is_err());
        assert!(has("test-bytes-ppc64"));
        assert!(!has("test-none-arm7"));
    }

    #[test]
    fn platform_tag_has_os_and_arch() {
        let p = platform();
        assert!(p.contains('-'));
        assert!(p.starts_with(std::env::consts::OS));
    }
}
