// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Runner binaries for every supported variant are embedded in the
//! daemon image under `build/<os>/<arch>/<variant>/bin/...` (the real
//! tree is populated by the release build; the `payload/` directory
//! checked into this crate holds placeholder binaries so the crate is
//! self-contained and its tests don't depend on a release pipeline).
//! `init` unpacks that tree into a working directory and indexes it by
//! variant tag.

use include_dir::{include_dir, Dir};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{Result, RunnerError};

static PAYLOAD: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/payload");

/// The stable, daemon-local name every runner binary is renamed to,
/// regardless of what the embedded tree called it.
const RUNNER_BINARY_NAME: &str = "inference_server";

/// Environment variable the runner reads to find its Metal shader
/// resources.
const METAL_RESOURCES_ENV: &str = "GGML_METAL_PATH_RESOURCES";

#[derive(Debug, Clone)]
pub struct PayloadStore {
    work_dir: PathBuf,
    available: HashMap<String, PathBuf>,
    metal_resources_dir: Option<PathBuf>,
}

impl PayloadStore {
    /// Enumerates the embedded tree for the running `(os, arch)`,
    /// decompressing and renaming each entry into `<work_dir>/<variant>/`.
    /// Extraction runs across a bounded pool of blocking tasks and must
    /// join before this function returns. Idempotent: re-entering `init`
    /// with the same `work_dir` leaves already-present files untouched.
    pub async fn init(work_dir: &Path) -> Result<Self> {
        Self::init_for(work_dir, std::env::consts::OS, std::env::consts::ARCH).await
    }

    pub async fn init_for(work_dir: &Path, os: &str, arch: &str) -> Result<Self> {
        std::fs::create_dir_all(work_dir)?;
        let glob = format!("build/{os}/{arch}/**/bin/**");
        let entries: Vec<PathBuf> = PAYLOAD
            .find(&glob)
            .map_err(|e| RunnerError::Config(format!("invalid payload glob {glob}: {e}")))?
            .filter_map(|entry| entry.as_file().map(|f| f.path().to_path_buf()))
            .collect();

        let mut tasks = tokio::task::JoinSet::new();
        for rel_path in entries {
            let work_dir = work_dir.to_path_buf();
            tasks.spawn_blocking(move || extract_one(&rel_path, &work_dir));
        }

        let mut available = HashMap::new();
        let mut metal_resources_dir = None;
        while let Some(res) = tasks.join_next().await {
            let extracted = res.map_err(|e| RunnerError::Spawn(e.to_string()))??;
            if extracted.variant == "metal" && extracted.file_name == "default.metallib" {
                metal_resources_dir = Some(extracted.dest_dir.clone());
            }
            available.insert(extracted.variant, extracted.dest_dir);
        }

        if let Some(dir) = &metal_resources_dir {
            std::env::set_var(METAL_RESOURCES_ENV, dir);
        }

        Ok(Self { work_dir: work_dir.to_path_buf(), available, metal_resources_dir })
    }

    /// Maps variant tag -> the directory holding that variant's binaries
    /// (to be prepended to the runner's dynamic-loader search path).
    pub fn available(&self) -> &HashMap<String, PathBuf> {
        &self.available
    }

    pub fn runner_binary_name() -> &'static str {
        RUNNER_BINARY_NAME
    }

    pub fn metal_resources_dir(&self) -> Option<&Path> {
        self.metal_resources_dir.as_deref()
    }

    /// Removes the working directory tree. Idempotent: removing an
    /// already-absent directory is not an error.
    pub fn cleanup(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct Extracted {
    variant: String,
    dest_dir: PathBuf,
    file_name: String,
}

/// The variant tag is the path component immediately above `bin`. This
/// naturally absorbs platforms where an extra build-configuration
/// directory is interposed between the arch and the variant: we don't
/// walk a fixed number of ancestors, we take whatever directly precedes
/// `bin`.
fn variant_from_path(rel_path: &Path) -> Result<String> {
    let components: Vec<_> = rel_path.components().collect();
    let bin_idx = components
        .iter()
        .position(|c| c.as_os_str() == "bin")
        .ok_or_else(|| RunnerError::Config(format!("no bin/ ancestor in {}", rel_path.display())))?;
    if bin_idx == 0 {
        return Err(RunnerError::Config(format!("no variant directory above bin/ in {}", rel_path.display())));
    }
    Ok(components[bin_idx - 1].as_os_str().to_string_lossy().into_owned())
}

fn extract_one(rel_path: &Path, work_dir: &Path) -> Result<Extracted> {
    let variant = variant_from_path(rel_path)?;
    let file = PAYLOAD
        .get_file(rel_path)
        .ok_or_else(|| RunnerError::Config(format!("missing embedded file {}", rel_path.display())))?;

    let mut contents = file.contents().to_vec();
    let mut file_name = rel_path
        .file_name()
        .ok_or_else(|| RunnerError::Config(format!("no file name in {}", rel_path.display())))?
        .to_string_lossy()
        .into_owned();

    if let Some(stripped) = file_name.strip_suffix(".gz") {
        contents = gunzip(&contents)?;
        file_name = stripped.to_string();
    }

    let renamed = rename_server_binary(&file_name);

    let dest_dir = work_dir.join(&variant);
    std::fs::create_dir_all(&dest_dir)?;
    let dest_path = dest_dir.join(&renamed);

    if !dest_path.exists() {
        let mut out = std::fs::File::create(&dest_path)?;
        out.write_all(&contents)?;
        set_executable(&dest_path)?;
    }

    Ok(Extracted { variant, dest_dir, file_name: renamed })
}

/// The embedded tree ships a generically-named `server` (or
/// `server.exe`) binary; the daemon renames it to a stable local name so
/// callers never need to know the upstream binary's own naming
/// convention.
fn rename_server_binary(file_name: &str) -> String {
    match file_name {
        "server" => RUNNER_BINARY_NAME.to_string(),
        "server.exe" => format!("{RUNNER_BINARY_NAME}.exe"),
        other => other.to_string(),
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
