//! Ban artifact rendering, writing and reload signalling.
//!
//! # Responsibilities
//! - Render the active ban set as an nginx `geo` map with metadata comments
//! - Replace the artifact file atomically (temp file + rename)
//! - Tell the enforcement layer to pick it up
//!
//! # Design Decisions
//! - Rendering is deterministic: bans are sorted by IP
//! - The artifact is a projection; the counter store stays authoritative

use std::ffi::OsString;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use serde::Serialize;

/// Body the enforcement layer returns for a banned address.
pub const DENIAL_BODY: &str =
    r#"{"error":"forbidden","message":"Your IP address has been temporarily banned."}"#;

/// One active ban.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BanRecord {
    pub ip: IpAddr,
    pub ban_until: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to write ban artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal ban artifact reload: {0}")]
    Reload(String),
}

/// Snapshot of active bans at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanArtifact {
    pub generated_at: u64,
    pub bans: Vec<BanRecord>,
}

impl BanArtifact {
    pub fn new(generated_at: u64, mut bans: Vec<BanRecord>) -> Self {
        bans.sort_by(|a, b| a.ip.cmp(&b.ip));
        Self { generated_at, bans }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Generated by shield-proxy. Do not edit.\n");
        out.push_str(&format!("# generated_at: {}\n", self.generated_at));
        out.push_str(&format!("# active_bans: {}\n", self.bans.len()));
        out.push_str("# denial_status: 403\n");
        out.push_str(&format!("# denial_body: {DENIAL_BODY}\n"));
        out.push_str("geo $remote_addr $shield_banned_ip {\n");
        out.push_str("    default 0;\n");
        for ban in &self.bans {
            out.push_str(&format!("    {} 1; # until {}\n", ban.ip, ban.ban_until));
        }
        out.push_str("}\n");
        out
    }
}

/// Tells the enforcement layer that the artifact changed.
pub trait ReloadTrigger: Send + Sync {
    fn reload(&self) -> Result<(), ArtifactError>;
}

/// Used when no reload command is configured.
#[derive(Debug, Default)]
pub struct NoopReload;

impl ReloadTrigger for NoopReload {
    fn reload(&self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

/// Runs an external command, e.g. `nginx -s reload`.
#[derive(Debug, Clone)]
pub struct CommandReload {
    program: String,
    args: Vec<String>,
}

impl CommandReload {
    /// Build from `[program, args...]`. Returns `None` for an empty command.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ReloadTrigger for CommandReload {
    fn reload(&self) -> Result<(), ArtifactError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| ArtifactError::Reload(format!("`{}`: {e}", self.program)))?;

        if !output.status.success() {
            return Err(ArtifactError::Reload(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Publishes rendered artifacts.
#[derive(Clone)]
pub struct ArtifactWriter {
    path: Option<PathBuf>,
    reload: Arc<dyn ReloadTrigger>,
}

impl ArtifactWriter {
    pub fn new(path: Option<PathBuf>, reload: Arc<dyn ReloadTrigger>) -> Self {
        Self { path, reload }
    }

    /// A writer that renders nowhere.
    pub fn disabled() -> Self {
        Self::new(None, Arc::new(NoopReload))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the artifact, then trigger the reload.
    ///
    /// A failed write skips the reload: there is nothing new to load.
    pub fn publish(&self, artifact: &BanArtifact) -> Result<(), ArtifactError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        write_atomic(path, &artifact.render()).map_err(|source| ArtifactError::Write {
            path: path.clone(),
            source,
        })?;
        self.reload.reload()
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
